// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use clap::Parser;
use tracing::info;

use cli::{Cli, Commands, SessionCommands};
use nils_config::AgentPaths;
use nils_gateway::{spawn_watcher, Supervisor};
use nils_store::{SessionStore, StoreSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    nils_log::init_tracing(&cli.log_level);

    let paths = match &cli.root {
        Some(root) => AgentPaths::new(root),
        None => AgentPaths::discover(),
    };

    match cli.command {
        Commands::Serve => serve(paths).await,
        Commands::Session { command } => session_command(paths, command).await,
    }
}

async fn serve(paths: AgentPaths) -> anyhow::Result<()> {
    let supervisor = Supervisor::init(paths).await?;
    let addr = supervisor.serve().await?;
    info!(%addr, "nils is serving");

    // Keep the watcher alive for the whole run; dropping it stops events.
    let _watcher = spawn_watcher(supervisor.clone())?;

    tokio::signal::ctrl_c().await?;
    supervisor.shutdown().await;
    Ok(())
}

async fn session_command(paths: AgentPaths, command: SessionCommands) -> anyhow::Result<()> {
    let store = SessionStore::new(paths.sessions_dir(), StoreSettings::default());
    match command {
        SessionCommands::List => {
            for item in store.list().await? {
                println!(
                    "{}  {:<24}  {:>4} msgs  {}",
                    item.id,
                    item.name.chars().take(24).collect::<String>(),
                    item.message_count,
                    item.last_message_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        SessionCommands::Delete { id } => {
            store.delete(&id).await?;
            println!("deleted {id}");
        }
    }
    Ok(())
}
