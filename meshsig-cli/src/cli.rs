// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "meshsig")]
#[command(about = "Peer discovery and MuSig2 signing-session tools")]
#[command(version)]
pub(crate) struct Cli {
    #[arg(short, long, global = true, help = "Config file (default: ~/.config/meshsig/config.toml)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Discovery cache database")]
    pub cache: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Generate a signing key
    Keygen {
        #[arg(short, long, help = "Write the secret key to this file instead of printing it")]
        output: Option<PathBuf>,
    },
    /// Sign an advertisement for this node
    Advertise {
        #[arg(short, long, help = "File holding the hex secret key")]
        key: PathBuf,
        #[arg(long)]
        peer_id: String,
        #[arg(long = "kind", help = "Transaction kind this signer co-signs (repeatable)")]
        kinds: Vec<String>,
        #[arg(long, default_value = "0")]
        fee: u64,
        #[arg(long, help = "Also store the advertisement in the local cache")]
        import: bool,
    },
    /// Inspect and maintain the discovery cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Run an in-process mesh and sign a message end to end
    Simulate {
        #[arg(short = 'n', long, default_value = "3")]
        participants: usize,
        #[arg(long, default_value = "0", help = "Participants that cannot be reached")]
        unreachable: usize,
        #[arg(short, long, default_value = "meshsig simulation")]
        message: String,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub(crate) enum CacheCommands {
    List,
    Show {
        peer_id: String,
    },
    /// Import an advertisement JSON file
    Import {
        file: PathBuf,
    },
    Remove {
        peer_id: String,
    },
    /// Drop expired advertisements
    Prune,
}

#[derive(Subcommand)]
pub(crate) enum ConfigCommands {
    Show,
    Path,
}
