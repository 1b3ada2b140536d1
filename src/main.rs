// ABOUTME: Main entry point for the krypton bot
// ABOUTME: Loads config, starts the session manager and the QR/health HTTP server

use anyhow::Result;
use clap::{Parser, Subcommand};
use krypton::{
    commands,
    config::Config,
    handlers::{default_handlers, ContactBook},
    logging,
    platform::{create_connector, DEFAULT_PLATFORM},
    server,
};
use krypton_core::{FileCredentialStore, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long in-flight handlers get to finish on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const LONG_ABOUT: &str = "Chat bot with QR pairing and command dispatch.

The WhatsApp connector is an optional feature. A binary built without it
exits at startup; build with `cargo build --release --features whatsapp`.";

#[derive(Parser)]
#[command(
    name = "krypton",
    version,
    about = "Chat bot with QR pairing and command dispatch (build with --features whatsapp)",
    long_about = LONG_ABOUT
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and serve (default)
    Start,
    /// Print the resolved configuration with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n╔══════════════════════════════════════════════════════════╗");
        eprintln!("║ PANIC! Bot crashed with the following error:            ║");
        eprintln!("╚══════════════════════════════════════════════════════════╝\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli.log_level)?;

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => run().await,
        Commands::Config => {
            let config = Config::load()?;
            println!("{:#?}", config);
            Ok(())
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::load()?;
    tracing::info!(
        name = %config.bot.display_name(),
        prefix = %config.bot.prefix,
        mods = config.bot.mods.len(),
        session_dir = %config.session.dir,
        restart_delay_ms = config.session.restart_delay_ms,
        port = config.server.port,
        "Configuration loaded"
    );

    let connector = create_connector(&config, DEFAULT_PLATFORM)?;
    let credentials = Arc::new(FileCredentialStore::new(&config.session.dir));
    let contacts = Arc::new(ContactBook::new());
    let host = config.server.host.clone();
    let port = config.server.port;

    let manager = SessionManager::builder(config, connector, credentials)
        .catalog(commands::catalog())
        .handlers(default_handlers(contacts))
        .build();

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn({
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        async move { server::serve(&host, port, manager, shutdown).await }
    });

    // Failures are retried by the manager itself
    manager.connect().await;

    let server_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down");
            None
        }
        result = &mut server => Some(result),
    };

    shutdown.cancel();
    manager.shutdown(DRAIN_TIMEOUT).await?;

    let result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    match result {
        Ok(inner) => inner,
        Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
    }
}
