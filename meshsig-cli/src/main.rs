// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

mod cli;
mod commands;
mod config;
mod error;
mod output;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::cli::*;
use crate::config::{Config, LogLevel};
use crate::error::Result;
use crate::output::Output;

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: LogLevel) {
    let use_json = std::env::var("MESHSIG_LOG_JSON").is_ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let out = Output::new();
    let cli = Cli::parse();

    let cfg = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            out.error(&e.to_string());
            std::process::exit(2);
        }
    };
    init_logging(cfg.log_level);

    if let Err(e) = run(&out, cli, &cfg) {
        out.error(&e.to_string());
        std::process::exit(1);
    }
}

fn run(out: &Output, cli: Cli, cfg: &Config) -> Result<()> {
    let cache_path = match cli.cache {
        Some(p) => p,
        None => cfg.cache_path()?,
    };
    debug!(cache = %cache_path.display(), "starting command");

    match cli.command {
        Commands::Keygen { output } => commands::keys::cmd_keygen(out, output.as_deref()),
        Commands::Advertise {
            key,
            peer_id,
            kinds,
            fee,
            import,
        } => commands::keys::cmd_advertise(out, cfg, &cache_path, &key, &peer_id, kinds, fee, import),
        Commands::Cache { command } => match command {
            CacheCommands::List => commands::cache::cmd_cache_list(out, &cache_path),
            CacheCommands::Show { peer_id } => {
                commands::cache::cmd_cache_show(out, &cache_path, &peer_id)
            }
            CacheCommands::Import { file } => {
                commands::cache::cmd_cache_import(out, &cache_path, &file)
            }
            CacheCommands::Remove { peer_id } => {
                commands::cache::cmd_cache_remove(out, &cache_path, &peer_id)
            }
            CacheCommands::Prune => commands::cache::cmd_cache_prune(out, &cache_path),
        },
        Commands::Simulate {
            participants,
            unreachable,
            message,
        } => commands::simulate::cmd_simulate(out, cfg, participants, unreachable, &message),
        Commands::Config { command } => match command {
            ConfigCommands::Show => commands::config::cmd_config_show(out, cfg, &cache_path),
            ConfigCommands::Path => commands::config::cmd_config_path(out, cli.config.as_deref()),
        },
    }
}
