//! Thin CLI entrypoint.
//!
//! The HTTP/WebSocket control surface (C7) is an external collaborator and
//! lives outside this crate; this binary only exposes diagnostic access to
//! the core so it can be exercised without standing up a server.

use std::io::Read;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentd::interpreter;

#[derive(Parser)]
#[command(name = "agentd", about = "Orchestration control plane core")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the output interpreter over a chunk of text (stdin or --file) and
    /// print detected attention items, assist, directives and cues as JSON.
    Interpret {
        #[arg(long)]
        file: Option<String>,
        #[arg(long, default_value = "session")]
        session_id: String,
    },
}

fn init_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    let filter_layer =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(log_level.into());

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            tracing::error!(%err, "command failed");
            ExitCode::from(1)
        }
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Interpret { file, session_id } => {
            let text = match file {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };

            let mut scanner = interpreter::Scanner::new(session_id);
            let report = scanner.feed(text.as_bytes());
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
