//! Interactive chat CLI
//!
//! Loads a model, primes the chat context, then streams responses for each
//! stdin line.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chatllama::{ChatSession, LoadEvent, SessionConfig, StreamToken};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("chatllama=info".parse().unwrap()))
        .init();

    let Some(model_path) = std::env::args().nth(1) else {
        eprintln!("usage: chatllama <model.gguf>");
        return ExitCode::FAILURE;
    };

    // per-user config when present, defaults otherwise
    let mut config = SessionConfig::default_path()
        .filter(|p| p.exists())
        .and_then(|p| SessionConfig::load(p).ok())
        .unwrap_or_default();
    config.model = PathBuf::from(model_path);

    info!("starting chatllama v{}", env!("CARGO_PKG_VERSION"));
    let session = ChatSession::llama();

    match run(&session, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(reason) => {
            eprintln!("error: {reason}");
            ExitCode::FAILURE
        }
    }
}

fn run(session: &ChatSession, config: SessionConfig) -> Result<(), String> {
    let events = session.load(config).map_err(|e| e.to_string())?;
    for event in events.iter() {
        match event {
            LoadEvent::Progress(p) => eprint!("\rloading model... {:3.0}%", p * 100.0),
            LoadEvent::Ready { n_ctx } => {
                eprintln!("\rmodel loaded (n_ctx = {n_ctx})   ");
                break;
            }
            LoadEvent::Failed(reason) => {
                eprintln!();
                return Err(reason);
            }
        }
    }

    session.start_chat().map_err(|e| e.to_string())?;

    let stdin = io::stdin();
    let mut out = io::stdout();
    loop {
        print!("\nUser: ");
        out.flush().ok();
        let Some(Ok(line)) = stdin.lock().lines().next() else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        print!("ChatLLaMa:");
        out.flush().ok();
        let (tokens, _stop) = session.send_turn(&line).map_err(|e| e.to_string())?;
        for token in tokens.iter() {
            match token {
                StreamToken::Token(fragment) => {
                    print!("{fragment}");
                    out.flush().ok();
                }
                StreamToken::Done => break,
                StreamToken::Error(reason) => {
                    eprintln!("\nturn aborted: {reason}");
                    break;
                }
            }
        }
        println!();
    }
    Ok(())
}
