use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::errors::ApiError;
use crate::history::ChatHistoryStore;

const OVERLOADED_MESSAGE: &str =
    "The AI service is currently overloaded. Please try again later.";

/// Chat capability the interactive loop drives. The loop never cares whether
/// retrieval, history windows or anything else sits behind it.
#[async_trait]
pub trait ChatAgent: Send + Sync {
    async fn chat(&self, input: &str) -> Result<String, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// The single place that decides whether a provider failure is worth a
/// retry. Deliberately a narrow text heuristic: a "503" marker or a
/// "service unavailable" phrase, nothing else.
pub fn classify_provider_error(err: &ApiError) -> ErrorClass {
    if matches!(err, ApiError::ServiceUnavailable) {
        return ErrorClass::Transient;
    }

    let text = err.to_string().to_lowercase();
    if text.contains("503") || text.contains("service unavailable") {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total dispatch attempts per turn, first try included.
    pub max_attempts: u32,
    /// Backoff before attempt n+1 is `backoff_unit * n` (linear).
    pub backoff_unit: Duration,
    /// Budget for a single provider call; elapsing counts as transient.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Reply(String),
    /// Transient failures exhausted the retry budget.
    Overloaded,
    /// Non-transient failure, surfaced verbatim.
    Fatal(String),
}

/// Drive one turn against the agent under the retry policy.
pub async fn dispatch_with_retry(
    agent: &dyn ChatAgent,
    input: &str,
    policy: &RetryPolicy,
) -> TurnOutcome {
    let mut attempt: u32 = 1;

    loop {
        let result = match tokio::time::timeout(policy.call_timeout, agent.chat(input)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::ServiceUnavailable),
        };

        match result {
            Ok(reply) => return TurnOutcome::Reply(reply),
            Err(err) => match classify_provider_error(&err) {
                ErrorClass::Transient if attempt < policy.max_attempts => {
                    tracing::warn!(
                        "Service temporarily unavailable. Retrying ({}/{})...",
                        attempt,
                        policy.max_attempts
                    );
                    tokio::time::sleep(policy.backoff_unit * attempt).await;
                    attempt += 1;
                }
                ErrorClass::Transient => return TurnOutcome::Overloaded,
                ErrorClass::Fatal => return TurnOutcome::Fatal(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user typed the quit token (or input closed).
    Quit,
    /// A non-transient provider error ended the session.
    Fatal(String),
}

/// Interactive read-eval loop over a chat agent.
///
/// Successful turns are persisted as two appends on the backing thread: the
/// user message and the assistant reply. That persistence is the loop's
/// post-condition, not the agent's.
pub struct ChatSession<'a> {
    agent: &'a dyn ChatAgent,
    history: &'a ChatHistoryStore,
    thread_id: String,
    policy: RetryPolicy,
    quit_token: String,
}

impl<'a> ChatSession<'a> {
    pub fn new(agent: &'a dyn ChatAgent, history: &'a ChatHistoryStore, thread_id: String) -> Self {
        Self {
            agent,
            history,
            thread_id,
            policy: RetryPolicy::default(),
            quit_token: "quit".to_string(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn run<R, W>(&self, reader: R, writer: &mut W) -> Result<SessionEnd, ApiError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();

        loop {
            write_line(writer, "\nYou:").await?;

            let Some(line) = lines.next_line().await.map_err(ApiError::internal)? else {
                return Ok(SessionEnd::Quit);
            };

            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            if input.eq_ignore_ascii_case(&self.quit_token) {
                return Ok(SessionEnd::Quit);
            }

            write_line(writer, "Agent is thinking...").await?;

            match dispatch_with_retry(self.agent, input, &self.policy).await {
                TurnOutcome::Reply(reply) => {
                    self.history
                        .append_message(
                            &self.thread_id,
                            Some("user".to_string()),
                            Some(input.to_string()),
                        )
                        .await?;
                    self.history
                        .append_message(
                            &self.thread_id,
                            Some("assistant".to_string()),
                            Some(reply.clone()),
                        )
                        .await?;

                    write_line(writer, &format!("Agent: {reply}")).await?;
                }
                TurnOutcome::Overloaded => {
                    write_line(writer, &format!("Error: {OVERLOADED_MESSAGE}")).await?;
                }
                TurnOutcome::Fatal(message) => {
                    write_line(writer, &format!("Error: {message}")).await?;
                    return Ok(SessionEnd::Fatal(message));
                }
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), ApiError> {
    writer
        .write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(ApiError::internal)?;
    writer.flush().await.map_err(ApiError::internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the scripted errors, then succeeds.
    struct ScriptedAgent {
        attempts: AtomicU32,
        failures: Vec<String>,
        reply: String,
    }

    impl ScriptedAgent {
        fn new(failures: &[&str], reply: &str) -> Self {
            Self {
                attempts: AtomicU32::new(0),
                failures: failures.iter().map(|s| s.to_string()).collect(),
                reply: reply.to_string(),
            }
        }

        fn attempt_count(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatAgent for ScriptedAgent {
        async fn chat(&self, _input: &str) -> Result<String, ApiError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) as usize;
            match self.failures.get(attempt) {
                Some(message) => Err(ApiError::Internal(message.clone())),
                None => Ok(self.reply.clone()),
            }
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl ChatAgent for SlowAgent {
        async fn chat(&self, _input: &str) -> Result<String, ApiError> {
            tokio::time::sleep(Duration::from_secs(300)).await;
            Ok("too late".to_string())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn test_history(thread_id: &str) -> ChatHistoryStore {
        let tmp = std::env::temp_dir().join(format!(
            "threadkeep-loop-test-{}.db",
            uuid::Uuid::new_v4()
        ));
        let store = ChatHistoryStore::new(tmp).await.unwrap();
        store
            .create(None, Some(thread_id.to_string()), Some(vec![]))
            .await
            .unwrap();
        store
    }

    #[test]
    fn classification_is_a_narrow_text_match() {
        let transient = ApiError::Internal("503 Service Unavailable".to_string());
        assert_eq!(classify_provider_error(&transient), ErrorClass::Transient);

        let phrased = ApiError::Internal("upstream said SERVICE UNAVAILABLE".to_string());
        assert_eq!(classify_provider_error(&phrased), ErrorClass::Transient);

        assert_eq!(
            classify_provider_error(&ApiError::ServiceUnavailable),
            ErrorClass::Transient
        );

        let fatal = ApiError::Internal("invalid API key".to_string());
        assert_eq!(classify_provider_error(&fatal), ErrorClass::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_two_transient_failures() {
        let agent = ScriptedAgent::new(
            &["503 Service Unavailable", "503 Service Unavailable"],
            "finally",
        );

        let outcome = dispatch_with_retry(&agent, "hi", &policy()).await;
        assert_eq!(outcome, TurnOutcome::Reply("finally".to_string()));
        assert_eq!(agent.attempt_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_failures_report_overloaded() {
        let agent = ScriptedAgent::new(
            &["503 error", "503 error", "503 error", "503 error"],
            "never",
        );

        let outcome = dispatch_with_retry(&agent, "hi", &policy()).await;
        assert_eq!(outcome, TurnOutcome::Overloaded);
        // Exactly three dispatches: the retry budget is total attempts.
        assert_eq!(agent.attempt_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_after_one_attempt() {
        let agent = ScriptedAgent::new(&["invalid API key"], "never");

        let outcome = dispatch_with_retry(&agent, "hi", &policy()).await;
        match outcome {
            TurnOutcome::Fatal(message) => assert!(message.contains("invalid API key")),
            other => panic!("expected fatal outcome, got {other:?}"),
        }
        assert_eq!(agent.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_linear_in_the_attempt_number() {
        let agent = ScriptedAgent::new(&["503", "503"], "done");

        let started = tokio::time::Instant::now();
        dispatch_with_retry(&agent, "hi", &policy()).await;

        // 2s before attempt 2, 4s before attempt 3.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_counts_as_transient() {
        let agent = SlowAgent;

        let outcome = dispatch_with_retry(&agent, "hi", &policy()).await;
        assert_eq!(outcome, TurnOutcome::Overloaded);
    }

    #[tokio::test]
    async fn quit_token_ends_the_session_without_dispatching() {
        let agent = ScriptedAgent::new(&[], "should not be called");
        let history = test_history("t-quit").await;
        let session = ChatSession::new(&agent, &history, "t-quit".to_string());

        let mut output = Vec::new();
        let end = session.run(&b"QUIT\n"[..], &mut output).await.unwrap();

        assert_eq!(end, SessionEnd::Quit);
        assert_eq!(agent.attempt_count(), 0);
    }

    #[tokio::test]
    async fn successful_turn_persists_user_and_assistant_messages() {
        let agent = ScriptedAgent::new(&[], "hello back");
        let history = test_history("t-turn").await;
        let session = ChatSession::new(&agent, &history, "t-turn".to_string());

        let mut output = Vec::new();
        let end = session
            .run(&b"hello there\nquit\n"[..], &mut output)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Quit);

        let thread = history.get_by_thread_id("t-turn").await.unwrap();
        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.messages[0].content, "hello there");
        assert_eq!(thread.messages[1].content, "hello back");
        assert!(thread.messages[1].timestamp.is_some());

        let printed = String::from_utf8(output).unwrap();
        assert!(printed.contains("Agent: hello back"));
    }

    #[tokio::test]
    async fn fatal_provider_error_ends_the_session_with_failure() {
        let agent = ScriptedAgent::new(&["invalid API key"], "never");
        let history = test_history("t-fatal").await;
        let session = ChatSession::new(&agent, &history, "t-fatal".to_string());

        let mut output = Vec::new();
        let end = session
            .run(&b"hello\nnever read\n"[..], &mut output)
            .await
            .unwrap();

        match end {
            SessionEnd::Fatal(message) => assert!(message.contains("invalid API key")),
            other => panic!("expected fatal end, got {other:?}"),
        }

        // Nothing persisted for the failed turn.
        let thread = history.get_by_thread_id("t-fatal").await.unwrap();
        assert!(thread.messages.is_empty());
    }

    #[tokio::test]
    async fn overloaded_turn_keeps_the_session_alive() {
        let agent = ScriptedAgent::new(&["503", "503", "503"], "eventually");
        let history = test_history("t-over").await;
        // Real clock here because the session touches SQLite; keep the
        // backoff negligible instead.
        let session = ChatSession::new(&agent, &history, "t-over".to_string()).with_policy(
            RetryPolicy {
                max_attempts: 3,
                backoff_unit: Duration::from_millis(1),
                call_timeout: Duration::from_secs(30),
            },
        );

        let mut output = Vec::new();
        let end = session
            .run(&b"first\nsecond\nquit\n"[..], &mut output)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Quit);

        // First turn burned the three scripted failures, second succeeded.
        assert_eq!(agent.attempt_count(), 4);
        let printed = String::from_utf8(output).unwrap();
        assert!(printed.contains("currently overloaded"));
        assert!(printed.contains("Agent: eventually"));

        let thread = history.get_by_thread_id("t-over").await.unwrap();
        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.messages[0].content, "second");
    }
}
