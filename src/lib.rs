//! Retrieval-augmented chat with per-session memory.
//!
//! A [`ChatPipeline`] answers each question in a session by retrieving
//! fragments relevant to it, formatting them as context, and asking a chat
//! model to answer from that context and the session's earlier turns.

// Public modules
pub mod chat;
pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod prompt;
pub mod retriever;
pub mod retry;
pub mod session;
pub mod types;

mod http;
mod observability;

// Re-exports
pub use completion::{CompletionClient, OpenAiChat};
pub use config::{RagArgs, RagConfig};
pub use context::format_context;
pub use error::{Error, ProviderFailure, Result};
pub use observability::register_biometrics;
pub use pipeline::{ChatPipeline, ChatPipelineBuilder, TurnOutcome, TurnStage};
pub use prompt::{PromptPayload, PromptTemplate};
pub use retriever::{PineconeRetriever, Retriever};
pub use retry::{RetryPolicy, Stage};
pub use session::{
    Session, SessionLimits, SessionStore, WhenFull, load_transcript, save_transcript,
};
pub use types::*;
