// Public modules
pub mod completion_result;
pub mod fragment;
pub mod message;

// Re-exports
pub use completion_result::{CompletionResult, Usage};
pub use fragment::Fragment;
pub use message::{Message, Role};
