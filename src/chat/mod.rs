//! Interactive console for a [`ChatPipeline`](crate::ChatPipeline).
//!
//! - [`commands`]: slash command parsing
//! - [`render`]: reply, history and error output

mod commands;
mod render;

pub use commands::{ChatCommand, help_text, parse_command};
pub use render::{PlainTextRenderer, Renderer};
