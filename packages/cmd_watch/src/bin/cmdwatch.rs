use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cmd_watch::{Backlog, CmdSession, MatchEvent, Regex, SessionConfig};

#[derive(Parser)]
#[command(name = "cmdwatch")]
#[command(about = "Run a command and print regex trigger matches from its output")]
struct Args {
    /// Command to run
    command: String,

    /// Arguments for the command
    args: Vec<String>,

    /// Trigger pattern (repeatable)
    #[arg(short, long = "trigger")]
    triggers: Vec<String>,

    /// Line to send to the process after start (repeatable)
    #[arg(short, long = "send")]
    send: Vec<String>,

    /// Print matches as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        "cmd_watch=debug"
    } else {
        "cmd_watch=warn"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let session = CmdSession::spawn(SessionConfig::new(&args.command, args.args.clone()))
        .context("failed to start process")?;
    info!("watching {} (pid {:?})", args.command, session.pid());

    for pattern in &args.triggers {
        let compiled = Regex::new(pattern)
            .with_context(|| format!("invalid trigger pattern: {pattern}"))?;
        let label = pattern.clone();
        let json = args.json;
        session
            .add_trigger_full(compiled, Backlog::ReplayHistory, move |event| {
                print_match(&label, &event, json)
            })
            .await?;
    }

    for line in &args.send {
        session.send_line(line).await?;
    }

    session.closed().await;
    Ok(())
}

fn print_match(pattern: &str, event: &MatchEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("[{}] {} @ {}", pattern, event.text, event.start);
    }
    Ok(())
}
