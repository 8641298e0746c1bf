pub mod agent;
pub mod config;
pub mod core;
pub mod history;
pub mod logging;
pub mod rag;
pub mod server;
pub mod state;
