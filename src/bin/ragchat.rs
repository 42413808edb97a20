//! Interactive console for retrieval-augmented chat.
//!
//! Each question is answered from passages retrieved out of a Pinecone index,
//! with the conversation so far kept as per-session memory.
//!
//! # Usage
//!
//! ```bash
//! export OPENAI_API_KEY=... PINECONE_API_KEY=... PINECONE_INDEX=news
//!
//! # Basic usage with default settings
//! ragchat
//!
//! # Use a named session, a different model and fewer fragments
//! ragchat --session support --model gpt-4o --top-k 3
//!
//! # Read settings from a file and log pipeline activity to stderr
//! ragchat --config ragchat.yaml --verbose
//! ```
//!
//! An empty line, `/quit`, or Ctrl+D exits.  Ctrl+C abandons the question in
//! flight without touching the session's history.

use std::sync::Arc;

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use ragchat::chat::{ChatCommand, PlainTextRenderer, Renderer, help_text, parse_command};
use ragchat::{ChatPipeline, RagArgs, RagConfig, Usage, load_transcript, save_transcript};

const DEFAULT_SESSION: &str = "console";

#[derive(Default)]
struct ConsoleStats {
    turns: u64,
    failures: u64,
    usage: Usage,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, _) = RagArgs::from_command_line_relaxed("ragchat [OPTIONS]");
    init_tracing(args.verbose);

    let mut renderer = PlainTextRenderer::with_color(!args.no_color);
    let config = match RagConfig::load(&args) {
        Ok(config) => config,
        Err(err) => {
            renderer.print_error(&err.to_string());
            std::process::exit(2);
        }
    };
    tracing::debug!(?config, "resolved configuration");
    let pipeline = ChatPipeline::from_config(&config)?;

    let mut session_id = args
        .session
        .clone()
        .unwrap_or_else(|| DEFAULT_SESSION.to_string());
    pipeline.sessions().get_or_create(&session_id)?;

    let mut rl = DefaultEditor::new()?;
    let mut stats = ConsoleStats::default();

    // Ctrl+C while a turn is in flight cancels it; at the prompt rustyline
    // reports it as ReadlineError::Interrupted instead.
    let interrupt = Arc::new(Notify::new());
    let interrupt_clone = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        interrupt_clone.notify_waiters();
    })?;

    println!(
        "RAG Chat (model: {}, index: {}, session: {})",
        config.chat_model,
        config.index_name.as_deref().unwrap_or("?"),
        session_id
    );
    println!("Type /help for commands, an empty line to exit\n");

    loop {
        let readline = rl.readline("You: ");

        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    println!("Goodbye!");
                    break;
                }

                let _ = rl.add_history_entry(line);

                if let Some(cmd) = parse_command(line) {
                    match cmd {
                        ChatCommand::Quit => {
                            println!("Goodbye!");
                            break;
                        }
                        ChatCommand::Clear => {
                            pipeline.sessions().clear(&session_id).await;
                            renderer.print_info("Conversation cleared.");
                        }
                        ChatCommand::History => {
                            let history = pipeline
                                .sessions()
                                .history(&session_id)
                                .await
                                .unwrap_or_default();
                            if history.is_empty() {
                                renderer.print_info("(no messages yet)");
                            }
                            for message in &history {
                                renderer.print_message(message);
                            }
                        }
                        ChatCommand::Session(id) => {
                            match pipeline.sessions().get_or_create(&id) {
                                Ok(session) => {
                                    let len = session.len().await;
                                    session_id = id;
                                    renderer.print_info(&format!(
                                        "Switched to session {session_id} ({len} messages)"
                                    ));
                                }
                                Err(err) => renderer.print_error(&err.to_string()),
                            }
                        }
                        ChatCommand::Sessions => {
                            for id in pipeline.sessions().session_ids() {
                                let marker = if id == session_id { "*" } else { " " };
                                println!("    {marker} {id}");
                            }
                        }
                        ChatCommand::SaveTranscript(path) => {
                            let saved = match pipeline.sessions().get_or_create(&session_id) {
                                Ok(session) => save_transcript(&session, &path).await,
                                Err(err) => Err(err),
                            };
                            match saved {
                                Ok(()) => {
                                    renderer.print_info(&format!("Transcript saved to {}", path))
                                }
                                Err(err) => renderer
                                    .print_error(&format!("Failed to save transcript: {}", err)),
                            }
                        }
                        ChatCommand::LoadTranscript(path) => {
                            let loaded = match load_transcript(&path) {
                                Ok(messages) => {
                                    match pipeline.sessions().get_or_create(&session_id) {
                                        Ok(session) => {
                                            let count = messages.len();
                                            session.replace_history(messages).await;
                                            Ok(count)
                                        }
                                        Err(err) => Err(err),
                                    }
                                }
                                Err(err) => Err(err),
                            };
                            match loaded {
                                Ok(count) => renderer.print_info(&format!(
                                    "Loaded {count} messages from {path}"
                                )),
                                Err(err) => renderer
                                    .print_error(&format!("Failed to load transcript: {}", err)),
                            }
                        }
                        ChatCommand::TopK(value) => match pipeline.set_top_k(value) {
                            Ok(()) => renderer.print_info(&format!("top_k set to {value}")),
                            Err(err) => renderer.print_error(&err.to_string()),
                        },
                        ChatCommand::Stats => {
                            print_stats(&pipeline, &config, &session_id, &stats).await;
                        }
                        ChatCommand::Help => {
                            for line in help_text().lines() {
                                println!("    {}", line);
                            }
                        }
                        ChatCommand::Invalid(message) => {
                            renderer.print_error(&message);
                        }
                    }
                    continue;
                }

                stats.turns += 1;
                tokio::select! {
                    outcome = pipeline.turn(&session_id, line) => match outcome {
                        Ok(outcome) => {
                            if let Some(usage) = outcome.usage {
                                stats.usage = stats.usage + usage;
                            }
                            renderer.print_reply(&outcome.reply);
                        }
                        Err(err) => {
                            stats.failures += 1;
                            renderer.print_error(&err.to_string());
                        }
                    },
                    _ = interrupt.notified() => {
                        stats.failures += 1;
                        renderer.print_interrupted();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {}", err));
                break;
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("ragchat=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn print_stats(
    pipeline: &ChatPipeline,
    config: &RagConfig,
    session_id: &str,
    stats: &ConsoleStats,
) {
    let messages = match pipeline.sessions().get(session_id) {
        Some(session) => session.len().await,
        None => 0,
    };
    println!("    Session Statistics:");
    println!("      Session: {}", session_id);
    println!("      Messages: {}", messages);
    println!("      Live sessions: {}", pipeline.sessions().len());
    println!("      Model: {}", config.chat_model);
    println!("      Embedding model: {}", config.embedding_model);
    println!("      Top-k: {}", pipeline.top_k());
    println!(
        "      Questions: {} ({} failed or cancelled)",
        stats.turns, stats.failures
    );
    println!(
        "      Total tokens: {} in / {} out",
        stats.usage.prompt_tokens, stats.usage.completion_tokens
    );
}
