mod commands;
mod gateway;

use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wxrelay_channels::wx849::Wx849Channel;
use wxrelay_core::{
    config::{self, BackendKind, Config, RelayConfig},
    message::ConverseRequest,
    shellexpand,
    traits::{Backend, Channel},
};
use wxrelay_memory::{AuditLogger, SessionStore};
use wxrelay_providers::{ChatApiBackend, OpenAiBackend};

#[derive(Parser)]
#[command(
    name = "wxrelay",
    version,
    about = "wxrelay: bridge a wx849 protocol service to a conversational AI backend"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay.
    Start,
    /// Check protocol service, backend, and session store health.
    Status,
    /// Send a one-shot message to the backend.
    Ask {
        /// The message to send.
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let _log_guard = init_tracing(&cfg.relay)?;

    match cli.command {
        Commands::Start => {
            cfg.validate()?;

            let backend = build_backend(&cfg);
            if !backend.is_available().await {
                warn!(
                    "backend '{}' is not reachable at {}; starting anyway",
                    backend.name(),
                    cfg.backend.base_url
                );
            }

            let channel = Arc::new(Wx849Channel::new(cfg.protocol.clone()));
            if !channel.is_available().await {
                warn!(
                    "protocol service at {} is not answering; polling will keep retrying",
                    channel.base_url()
                );
            }

            let store = SessionStore::new(&cfg.session).await?;

            info!("wxrelay: starting relay '{}'", cfg.relay.name);
            let gw = Arc::new(gateway::Gateway::new(&cfg, channel, backend, store));
            gw.run().await?;
        }
        Commands::Status => {
            println!("wxrelay status\n");
            println!("Config: {}", cli.config);
            match cfg.validate() {
                Ok(()) => println!("  config: ok"),
                Err(e) => println!("  config: {e}"),
            }
            println!();

            let channel = Wx849Channel::new(cfg.protocol.clone());
            println!(
                "  protocol ({}): {}",
                channel.base_url(),
                if channel.is_available().await {
                    "online"
                } else {
                    "unreachable or logged out"
                }
            );

            let backend = build_backend(&cfg);
            println!(
                "  backend {} ({}): {}",
                backend.name(),
                cfg.backend.base_url,
                if backend.is_available().await {
                    "available"
                } else {
                    "unavailable"
                }
            );
            println!();

            let store = SessionStore::new(&cfg.session).await?;
            let stats = store.stats().await?;
            println!("  conversations: {}", stats.conversations);
            println!("  in flight: {}", stats.in_flight);

            let audit = AuditLogger::new(store.pool().clone());
            for (status, count) in audit.counts().await? {
                println!("  audit {status}: {count}");
            }
        }
        Commands::Ask { message } => {
            if message.is_empty() {
                anyhow::bail!("no message provided. Usage: wxrelay ask <message>");
            }

            let backend = build_backend(&cfg);
            if !backend.is_available().await {
                anyhow::bail!(
                    "backend '{}' is not available at {}",
                    backend.name(),
                    cfg.backend.base_url
                );
            }

            let request = ConverseRequest {
                conversation_key: "cli".to_string(),
                user: "cli".to_string(),
                text: message.join(" "),
                persona: cfg.session.default_persona.clone(),
                history_ref: None,
            };
            let reply = backend.converse(&request).await?;
            println!("{}", reply.text);
        }
    }

    Ok(())
}

/// Install the global subscriber: stdout always, plus a daily-rolling file
/// when `relay.log_file` is set. The guard must live as long as the process.
fn init_tracing(relay: &RelayConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&relay.log_level));

    let (file_layer, guard) = if relay.log_file.is_empty() {
        (None, None)
    } else {
        let path = shellexpand(&relay.log_file);
        let path = Path::new(&path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("relay.log_file has no file name: {}", relay.log_file))?;
        std::fs::create_dir_all(dir)?;

        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Build the configured backend.
fn build_backend(cfg: &Config) -> Arc<dyn Backend> {
    let backend = &cfg.backend;
    match backend.kind {
        BackendKind::ChatApi => Arc::new(ChatApiBackend::from_config(
            backend.base_url.clone(),
            backend.api_key.clone(),
            backend.response_mode,
            backend.timeout_secs,
        )),
        BackendKind::Openai => Arc::new(OpenAiBackend::from_config(
            backend.base_url.clone(),
            backend.api_key.clone(),
            backend.model.clone(),
            cfg.personas.clone(),
            backend.timeout_secs,
        )),
    }
}
