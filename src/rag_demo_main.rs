use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::BufReader;

use threadkeep_backend::agent::{ChatSession, GeminiProvider, RagAgent, SessionEnd};
use threadkeep_backend::config::{AgentConfig, AppPaths};
use threadkeep_backend::logging;
use threadkeep_backend::rag::{load_documents_from_dir, MemoryVectorStore, RagConfig};
use threadkeep_backend::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let paths = AppPaths::new();
    logging::init(&paths);

    println!("Threadkeep RAG Demo");
    println!("===================");

    // Missing credentials are a startup failure, before any loop runs.
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            eprintln!("Please add your Gemini configuration to the environment:");
            eprintln!("  GEMINI_API_KEY=your-api-key");
            eprintln!("  GEMINI_MODEL=gemini-2.5-flash");
            return ExitCode::FAILURE;
        }
    };

    let docs_dir = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("public"));

    match run(config, docs_dir).await {
        Ok(SessionEnd::Quit) => ExitCode::SUCCESS,
        Ok(SessionEnd::Fatal(_)) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AgentConfig, docs_dir: PathBuf) -> anyhow::Result<SessionEnd> {
    let state = AppState::initialize().await?;

    let provider = Arc::new(GeminiProvider::new(&config)?);
    let vector_store = Arc::new(MemoryVectorStore::new());

    let thread_id = format!("demo-{}", Utc::now().format("%Y%m%d-%H%M%S"));
    state
        .history
        .create(None, Some(thread_id.clone()), Some(vec![]))
        .await?;
    println!("Using thread ID: {}", thread_id);

    let agent = RagAgent::with_defaults(
        provider.clone(),
        provider,
        vector_store,
        state.history.clone(),
        thread_id.clone(),
    );

    if docs_dir.is_dir() {
        let chunks = load_documents_from_dir(&docs_dir, &RagConfig::default())?;
        if chunks.is_empty() {
            println!("No documents found in {}", docs_dir.display());
        } else {
            let count = agent.add_documents(chunks).await?;
            println!("Indexed {} chunks from {}", count, docs_dir.display());
        }
    } else {
        println!(
            "Document directory {} does not exist; continuing without retrieval context",
            docs_dir.display()
        );
    }

    println!("Interactive chat with RAG agent");
    println!("Type \"quit\" to exit");

    let session = ChatSession::new(&agent, &state.history, thread_id);
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    let end = session.run(stdin, &mut stdout).await?;
    Ok(end)
}
