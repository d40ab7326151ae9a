//! Otto - an agent-loop coding assistant for the terminal.
//!
//! Reads user turns from stdin, streams engine events to stdout, and
//! supports a small set of slash commands for session control. Ctrl-C
//! aborts the in-flight turn instead of the process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use otto_core::agent::{Engine, LoopEvent};
use otto_core::config::EngineConfig;
use otto_core::persist::FilePersistence;

mod builtin;

const SYSTEM_PROMPT: &str = "You are Otto, a coding assistant. Use the available tools to \
inspect and modify the user's project. Prefer small, verifiable steps and report what you did.";

/// Otto - AI coding assistant
#[derive(Parser)]
#[command(name = "otto")]
#[command(about = "An agent-loop coding assistant", long_about = None)]
struct Cli {
    /// Path to a config file (defaults to ~/.config/otto/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured model
    #[arg(short, long)]
    model: Option<String>,

    /// Stream responses token by token
    #[arg(long)]
    stream: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path.clone())?,
        None => EngineConfig::load()?,
    };
    if let Some(model) = cli.model {
        config.model = model;
    }
    if cli.stream {
        config.stream = true;
    }

    let persistence = FilePersistence::new(EngineConfig::config_dir().join("session"));
    let (mut engine, mut events) = Engine::with_http(
        config,
        Arc::new(builtin::registry()),
        None,
        Arc::new(persistence),
        SYSTEM_PROMPT,
    );

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(event);
        }
    });

    engine.run_startup_hook().await?;

    println!("otto ready. /help for commands, /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line.as_str(), "")) {
            ("/quit" | "/exit", _) => break,
            ("/help", _) => {
                println!(
                    "/clear          start a fresh context\n\
                     /mood VALUE     change the assistant's mood\n\
                     /persona VALUE  change the assistant's persona\n\
                     /task VALUE     set the active task\n\
                     /rephrase TEXT  redo the last response\n\
                     /quit           exit"
                );
            }
            ("/clear", _) => engine.clear_cache().await?,
            ("/mood", value) if !value.is_empty() => {
                engine.set_mood(value).await?;
            }
            ("/persona", value) if !value.is_empty() => {
                engine.set_persona(value).await?;
            }
            ("/task", value) if !value.is_empty() => {
                engine.set_active_task(value).await?;
            }
            ("/rephrase", instruction) => {
                let instruction = if instruction.is_empty() {
                    "Please rephrase your last response."
                } else {
                    instruction
                };
                run_turn(&mut engine, |e| e.rephrase_last(instruction)).await?;
            }
            _ if line.starts_with('/') => println!("unknown command: {line}"),
            _ => run_turn(&mut engine, |e| e.send_message(&line)).await?,
        }
    }

    engine.shutdown().await?;
    Ok(())
}

/// Drive one turn, turning Ctrl-C into a cooperative abort.
async fn run_turn<'a, F, Fut>(engine: &'a mut Engine, turn: F) -> Result<()>
where
    F: FnOnce(&'a mut Engine) -> Fut,
    Fut: std::future::Future<Output = Result<()>> + 'a,
{
    let token = engine.cancellation_token();
    let fut = turn(engine);
    tokio::pin!(fut);
    loop {
        tokio::select! {
            result = &mut fut => return result,
            _ = tokio::signal::ctrl_c() => {
                token.cancel();
            }
        }
    }
}

fn print_event(event: LoopEvent) {
    match event {
        LoopEvent::TextDelta { delta } => {
            use std::io::Write;
            print!("{delta}");
            std::io::stdout().flush().ok();
        }
        LoopEvent::AssistantMessage { content } => println!("{content}"),
        LoopEvent::ToolCallStart { name, arguments, .. } => {
            println!("[tool] {name} {arguments}");
        }
        LoopEvent::ToolExecuting { .. } => {}
        LoopEvent::ToolResult { output, is_error, .. } => {
            let marker = if is_error { "error" } else { "ok" };
            let first_line = output.lines().next().unwrap_or("");
            println!("[tool {marker}] {first_line}");
        }
        LoopEvent::SystemNotice { message } => println!("[system] {message}"),
        LoopEvent::BackendChanged { backend, model } => {
            println!("[system] backend -> {backend} ({model})");
        }
        LoopEvent::ModelChanged { model } => println!("[system] model -> {model}"),
        LoopEvent::CacheCleared => println!("[system] context cleared"),
        LoopEvent::RoundLimitReached { limit } => {
            println!("[system] stopped after {limit} rounds");
        }
        LoopEvent::Cancelled => println!("\n[cancelled]"),
        LoopEvent::Error { error } => eprintln!("[error] {error}"),
        LoopEvent::TurnComplete { .. } | LoopEvent::Finished => {}
    }
}
