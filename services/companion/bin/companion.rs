//! Main Entrypoint for the Companion
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Initializing logging.
//! 3. Constructing the long-lived services.
//! 4. Logging in, which starts the token refresher.
//! 5. Driving the session from the console until asked to quit.

use anyhow::Context;
use buddychat_companion::{config::Config, console::ConsoleCommand, state::AppState};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Voice companion session client")]
struct Args {
    /// Use the local development backend (same as TEST_LOCAL=1).
    #[arg(long)]
    local: bool,

    /// Start a chat as soon as login succeeds.
    #[arg(long)]
    autostart: bool,
}

/// Listens for the `Ctrl+C` signal.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if args.local {
        config.use_local_backend();
    }

    // --- 2. Initialize Logging ---
    let filter = EnvFilter::try_new(config.log_level.as_str())
        .context("Failed to build log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(backend = %config.backend_url, "Configuration loaded. Initializing services...");

    // --- 3. Initialize Shared Services ---
    let state = AppState::new(config).context("Failed to initialize services")?;
    state.backend.log_health().await;

    // --- 4. Log In ---
    let backend = state.backend.clone();
    let session = state.session.clone();
    let autostart = args.autostart;
    let login = state
        .tokens
        .initial_login(move |token| {
            tokio::spawn(async move {
                match backend.fetch_profile(&token).await {
                    Ok(profile) => info!(
                        "Profile fetch success! Welcome, {} {} | {}",
                        profile.plwd.first_name, profile.plwd.last_name, profile.plwd.username
                    ),
                    Err(e) => warn!("Profile fetch failed: {}", e),
                }
            });
            if autostart {
                session.start();
            }
        })
        .await;
    if let Err(e) = login {
        error!("Login failed; chats cannot start until the process is restarted: {}", e);
    }

    // --- 5. Console Loop ---
    println!("Type /start to begin a chat, /stop to end it, /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read from stdin: {}", e);
                        break;
                    }
                };
                match ConsoleCommand::parse(&line) {
                    Some(ConsoleCommand::Start) => state.session.start(),
                    Some(ConsoleCommand::Stop) => state.session.stop_with("operator stop"),
                    Some(ConsoleCommand::Quit) => break,
                    Some(ConsoleCommand::Say(text)) => {
                        if state.input.is_listening() {
                            state.session.handle_utterance(text);
                        } else {
                            println!("(not listening)");
                        }
                    }
                    None => {}
                }
            }
        }
    }

    // --- 6. Graceful Shutdown ---
    state.session.shutdown().await;
    state.tokens.stop_refresher();
    info!("Companion has shut down.");
    Ok(())
}
