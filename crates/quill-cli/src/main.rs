//! quill - command-line client for the documentation agent

mod config;
mod ui;
mod utils;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quill_agent::{EventSourceFeed, HttpTransport, InteractionState, LiveFeed, SessionController};
use quill_wire::{ApiClient, Decision, JobQuery};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// quill - talk to the documentation agent and watch repository activity
#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Backend origin (overrides config file)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with the agent (interactive when no message is given)
    Chat {
        /// Message to send
        message: Option<String>,

        /// JSON context attached to every message
        #[arg(long)]
        context: Option<String>,
    },
    /// Stream live events for one or more repositories
    Watch {
        /// Repository IDs
        #[arg(required = true)]
        resources: Vec<String>,

        /// Reopen dropped channels with backoff
        #[arg(long)]
        reconnect: bool,
    },
    /// List connected repositories
    Repos {
        /// List repositories that could be connected instead
        #[arg(long)]
        available: bool,
    },
    /// List jobs
    Jobs {
        /// Only jobs for this repository ID
        #[arg(long)]
        repo: Option<String>,

        /// Only jobs with this status
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of jobs
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Show the agent's advertised capabilities
    Capabilities,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose || std::env::var_os("RUST_LOG").is_some() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("quill=debug,quill_wire=debug,quill_agent=debug")
        });
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();
    let client = ApiClient::new(cfg.api_config(args.api_url))?;
    tracing::debug!("Using {}", client.config().base_url());

    match args.command.unwrap_or(Command::Chat {
        message: None,
        context: None,
    }) {
        Command::Chat { message, context } => {
            let context = context
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--context must be valid JSON")?;
            let session = SessionController::new(Arc::new(HttpTransport::new(client)));
            match message {
                Some(message) => run_turn(&session, &message, context, ui::ask_decision).await,
                None => run_interactive(&session, context).await,
            }
        }
        Command::Watch {
            resources,
            reconnect,
        } => run_watch(client, &cfg, resources, reconnect).await,
        Command::Repos { available } => {
            if available {
                ui::print_available_repos(&client.available_repos().await?);
            } else {
                ui::print_repos(&client.connected_repos().await?);
            }
            Ok(())
        }
        Command::Jobs {
            repo,
            status,
            limit,
        } => {
            let query = JobQuery {
                repo_id: repo,
                status,
                limit,
            };
            ui::print_jobs(&client.jobs(&query).await?);
            Ok(())
        }
        Command::Capabilities => {
            let capabilities = client.capabilities().await?;
            println!("{}", serde_json::to_string_pretty(&capabilities)?);
            Ok(())
        }
    }
}

async fn run_interactive(session: &SessionController, context: Option<Value>) -> anyhow::Result<()> {
    use std::io::{self, Write};

    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!("quill ({})", env!("CARGO_PKG_VERSION"));
        eprintln!("Type /reset to start over, /quit to exit.");
        eprintln!();
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/reset" => {
                session.reset();
                println!("Session cleared.");
                continue;
            }
            _ => {}
        }

        println!();
        if let Err(e) = run_turn(session, input, context.clone(), ui::ask_decision).await {
            eprintln!("Error: {}", e);
        }
        println!();
    }

    Ok(())
}

/// Send one message and follow the session until it settles, asking the
/// user whenever the agent wants to run a gated tool call.
///
/// `ask` is run on a blocking thread for each prompt; `None` abandons the
/// session.
async fn run_turn<F>(
    session: &SessionController,
    text: &str,
    context: Option<Value>,
    ask: F,
) -> anyhow::Result<()>
where
    F: Fn() -> std::io::Result<Option<(Decision, Option<Value>)>> + Clone + Send + 'static,
{
    let mut rx = session.subscribe();
    let before = session.snapshot();
    let task = session.spawn_send(text, context)?;
    // taken after the send so the first pass sees the started session
    let mut shown = rx.borrow_and_update().clone();
    ui::render_transition(&before, &shown);

    loop {
        if let Some(ref pending) = shown.confirmation {
            match tokio::task::spawn_blocking(ask.clone()).await?? {
                Some((decision, modified_args)) => {
                    if let Err(e) = session.resolve(decision, modified_args).await {
                        eprintln!("Could not send decision for {}: {}", pending.tool, e);
                    }
                }
                None => {
                    session.reset();
                    break;
                }
            }
        } else if settled(&shown) {
            break;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted.");
                session.reset();
                break;
            }
        }
        let next = rx.borrow_and_update().clone();
        ui::render_transition(&shown, &next);
        shown = next;
    }

    let _ = task.await;
    Ok(())
}

fn settled(state: &InteractionState) -> bool {
    !state.is_streaming && state.confirmation.is_none()
}

async fn run_watch(
    client: ApiClient,
    cfg: &config::Config,
    resources: Vec<String>,
    reconnect: bool,
) -> anyhow::Result<()> {
    let feed = LiveFeed::with_history_limit(
        Arc::new(EventSourceFeed::new(client)),
        cfg.feed_history(),
    );
    let mut events = feed.listen();
    let reconnect = reconnect || cfg.reconnect.enabled();

    let mut handles = Vec::with_capacity(resources.len());
    for resource_id in resources {
        let handle = if reconnect {
            feed.subscribe_with_reconnect(resource_id, cfg.reconnect.policy())
        } else {
            feed.subscribe(resource_id.clone())
                .await
                .with_context(|| format!("Failed to open live feed for {}", resource_id))?
        };
        handles.push(handle);
    }
    eprintln!("Watching {} (Ctrl-C to stop)", feed.active().join(", "));

    let all_closed = futures::future::join_all(handles.iter_mut().map(|h| h.closed()));
    tokio::pin!(all_closed);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", ui::feed_line(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} feed events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut all_closed => {
                eprintln!("All live feeds closed.");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // dropping the handles closes any channel still open
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use quill_agent::ChatTransport;
    use quill_wire::{ChatRequest, ConfirmRequest, ServerEventStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Streams one confirmation prompt after a short delay, then ends.
    #[derive(Default)]
    struct GatedTransport {
        confirms: Mutex<Vec<ConfirmRequest>>,
    }

    #[async_trait]
    impl ChatTransport for GatedTransport {
        async fn open_chat(&self, _request: ChatRequest) -> quill_wire::Result<ServerEventStream> {
            let body = async_stream::stream! {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let line = r#"data: {"type":"confirmation","data":{"tool":"write_file","args":{"path":"a.md"},"message":"Apply edit?"}}"#;
                yield Ok::<_, quill_wire::Error>(format!("{}\n", line).into_bytes());
            };
            Ok(quill_wire::read_events(body))
        }

        async fn confirm(&self, request: ConfirmRequest) -> quill_wire::Result<()> {
            self.confirms.lock().push(request);
            Ok(())
        }
    }

    fn gated_session() -> (SessionController, Arc<GatedTransport>) {
        let transport = Arc::new(GatedTransport::default());
        (SessionController::new(transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_run_turn_prompts_at_gate_and_sends_decision() {
        let (session, transport) = gated_session();
        let prompts = Arc::new(AtomicUsize::new(0));
        let counter = prompts.clone();

        tokio::time::timeout(
            Duration::from_secs(2),
            run_turn(&session, "edit", None, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some((Decision::Reject, None)))
            }),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(prompts.load(Ordering::SeqCst), 1);
        let confirms = transport.confirms.lock();
        assert_eq!(confirms.len(), 1);
        assert_eq!(confirms[0].action, Decision::Reject);
        let state = session.snapshot();
        assert!(state.confirmation.is_none());
        assert!(!state.is_streaming);
    }

    #[tokio::test]
    async fn test_run_turn_abandons_session_on_eof() {
        let (session, transport) = gated_session();

        tokio::time::timeout(
            Duration::from_secs(2),
            run_turn(&session, "edit", None, || Ok(None)),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(transport.confirms.lock().is_empty());
        assert_eq!(session.snapshot(), InteractionState::default());
    }
}
