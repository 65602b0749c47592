pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod knowledge;
pub mod llm_client;
pub mod runtime;
pub mod source;
