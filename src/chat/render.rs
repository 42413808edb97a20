//! Output rendering for the console.
//!
//! Replies, history and notices go to stdout; errors go to stderr.  ANSI
//! styling can be turned off for piping or dumb terminals.

use std::io::{self, Stdout, Write};

use crate::types::{Message, Role};

/// ANSI escape code for dim text (used for notices).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code for bold text.
const ANSI_BOLD: &str = "\x1b[1m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for the user's turns).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for green text (used for the assistant's turns).
const ANSI_GREEN: &str = "\x1b[32m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// Trait for rendering console output.
pub trait Renderer: Send {
    /// Print the assistant's reply to the last question.
    fn print_reply(&mut self, reply: &str);

    /// Print a stored message, e.g. when listing history.
    fn print_message(&mut self, message: &Message);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);

    /// Called when a turn is cancelled by the user.
    fn print_interrupted(&mut self);
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer {
    stdout: Stdout,
    use_color: bool,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            stdout: io::stdout(),
            use_color,
        }
    }

    /// Returns whether ANSI styling is enabled.
    pub fn use_color(&self) -> bool {
        self.use_color
    }

    fn flush(&mut self) {
        let _ = self.stdout.flush();
    }

    /// Formats `text` under a speaker label.
    pub fn labeled(&self, role: Role, text: &str) -> String {
        let (label, color) = match role {
            Role::User => ("You", ANSI_CYAN),
            Role::Assistant => ("Assistant", ANSI_GREEN),
            Role::System => ("System", ANSI_DIM),
        };
        if self.use_color {
            format!("{ANSI_BOLD}{color}{label}:{ANSI_RESET} {text}")
        } else {
            format!("{label}: {text}")
        }
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn print_reply(&mut self, reply: &str) {
        println!("{}", self.labeled(Role::Assistant, reply));
        self.flush();
    }

    fn print_message(&mut self, message: &Message) {
        println!("{}", self.labeled(message.role(), message.content()));
        self.flush();
    }

    fn print_error(&mut self, error: &str) {
        if self.use_color {
            eprintln!("{ANSI_RED}Error:{ANSI_RESET} {error}");
        } else {
            eprintln!("Error: {error}");
        }
    }

    fn print_info(&mut self, info: &str) {
        if self.use_color {
            println!("{ANSI_DIM}{info}{ANSI_RESET}");
        } else {
            println!("{info}");
        }
        self.flush();
    }

    fn print_interrupted(&mut self) {
        self.print_info("[interrupted]");
    }
}
