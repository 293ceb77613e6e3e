//! Daemon-less entry point: load config, wire the orchestrator, run one
//! command.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roundtable::cli::{Cli, Command};
use roundtable::config::Config;
use roundtable::engine::Orchestrator;
use roundtable::memory::JsonlHistoryStore;
use roundtable::tools::InvocationContext;
use roundtable::utils::generate_nonce;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| roundtable::roundtable_home().join("config.yaml"));
    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("load {}", config_path.display()))?;

    match cli.command {
        Command::Check => {
            println!("config ok: {}", config_path.display());
            Ok(())
        }
        Command::Agents => {
            for entry in &config.agents {
                let role = if entry.coordinator { "coordinator" } else { "specialist" };
                println!("{:<24} {:<12} {}", entry.id, role, entry.description);
            }
            Ok(())
        }
        Command::Ask {
            question,
            session,
            user,
            verbose,
        } => {
            let persistence = Arc::new(JsonlHistoryStore::new(
                roundtable::roundtable_home().join("sessions"),
            ));
            let orchestrator = Orchestrator::from_config(&config, persistence)?;

            let session_id = session.unwrap_or_else(generate_nonce);
            info!(session = %session_id, "processing question");

            // Mirror activity events to stderr when asked.
            let watcher = if verbose {
                let streamer = orchestrator.streamer();
                let subscription = streamer.subscribe(&session_id);
                Some(tokio::spawn(async move {
                    loop {
                        let event = subscription.recv().await;
                        eprintln!(
                            "[{}] {} {} {:?} {}",
                            event.session_id,
                            event.agent_name,
                            event.action,
                            event.status,
                            event.details
                        );
                    }
                }))
            } else {
                None
            };

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_cancel.cancel();
                }
            });

            let context = InvocationContext::new(user, &session_id);
            match orchestrator.process_message(&question, &context, &cancel).await {
                Ok(outcome) => {
                    println!("{}", outcome.answer);
                    if let Some(watcher) = watcher {
                        watcher.abort();
                    }
                    Ok(())
                }
                Err(kind) => {
                    if let Some(watcher) = watcher {
                        watcher.abort();
                    }
                    eprintln!("{}", kind.user_message());
                    std::process::exit(1);
                }
            }
        }
    }
}
