//! Slash command parsing for the console.
//!
//! Lines starting with `/` control the console itself and are never sent
//! through the pipeline.

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Clear the current session's history.
    Clear,

    /// Print the current session's history.
    History,

    /// Switch to another session, creating it if needed.
    Session(String),

    /// List live sessions.
    Sessions,

    /// Save the current session's history to a file.
    SaveTranscript(String),

    /// Replace the current session's history with a saved transcript.
    LoadTranscript(String),

    /// Set the number of fragments retrieved per turn.
    TopK(usize),

    /// Display session statistics.
    Stats,

    /// Display help information.
    Help,

    /// Exit the console.
    Quit,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a command, or `None` if it
/// should be treated as a question.
///
/// # Examples
///
/// ```
/// # use ragchat::chat::parse_command;
/// assert!(parse_command("/quit").is_some());
/// assert!(parse_command("/session support").is_some());
/// assert!(parse_command("What is X?").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "clear" => ChatCommand::Clear,
        "history" => ChatCommand::History,
        "session" => match argument {
            Some(id) if !id.contains(char::is_whitespace) => ChatCommand::Session(id.to_string()),
            Some(_) => ChatCommand::Invalid("/session ids cannot contain spaces".to_string()),
            None => ChatCommand::Invalid("/session requires a session id".to_string()),
        },
        "sessions" => ChatCommand::Sessions,
        "save" => match argument {
            Some(arg) => ChatCommand::SaveTranscript(arg.to_string()),
            None => ChatCommand::Invalid("/save requires a file path".to_string()),
        },
        "load" => match argument {
            Some(arg) => ChatCommand::LoadTranscript(arg.to_string()),
            None => ChatCommand::Invalid("/load requires a file path".to_string()),
        },
        "top_k" => match argument {
            Some(arg) => match arg.parse::<usize>() {
                Ok(value) if value > 0 => ChatCommand::TopK(value),
                _ => ChatCommand::Invalid("/top_k expects a positive integer".to_string()),
            },
            None => ChatCommand::Invalid("/top_k requires a value".to_string()),
        },
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        "stats" | "status" => ChatCommand::Stats,
        _ => ChatCommand::Invalid(format!("Unknown command: /{}", command)),
    };

    Some(result)
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /clear                 Clear this session's history
  /history               Show this session's history
  /session <id>          Switch to another session
  /sessions              List live sessions
  /save <file>           Save this session's transcript
  /load <file>           Load a transcript into this session
  /top_k <n>             Set fragments retrieved per question
  /stats                 Show session statistics
  /help                  Show this help message
  /quit                  Exit (an empty line also exits)"#
}
