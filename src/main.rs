//! # Gorrent BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent protocol implementation
//! - HTTP, HTTPS and UDP tracker support with parallel announces
//! - Multi-file torrents written piece-by-piece to pre-allocated files
//! - Piece verification with SHA-1 hashing
//! - Offline verification of downloaded content
//! - Persisted download state and progress
//!
//! ## Usage
//!
//! ```bash
//! gorrent download <torrent_file>
//! gorrent verify <torrent_file> [<content_path>]
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, loads the torrent, coordinates the
//!   download
//! - **Tracker threads**: One per announce URL during peer discovery
//! - **Worker threads**: Each downloads pieces from one peer at a time
//! - **Channels**: Coordinate piece work distribution and shutdown

mod bencode;
mod bitfield;
mod config;
mod download;
mod handshake;
mod message;
mod metainfo;
mod peer;
mod session;
mod store;
mod tracker;
mod tracker_http;
mod tracker_udp;
mod verify;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::store::JsonStore;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify downloaded content against a torrent file
    Verify {
        /// Path to the .torrent file
        torrent: String,
        /// Path to the directory containing the content
        #[arg(default_value = ".")]
        content_path: String,
    },
    /// Download the content described by a torrent file
    Download {
        /// Path to the .torrent file
        torrent: String,
    },
}

fn run(args: Args) -> Result<()> {
    let config = Config::from_env();

    match args.command {
        Command::Verify {
            torrent,
            content_path,
        } => {
            verify::verify_torrent(Path::new(&torrent), Path::new(&content_path))?;
            println!("Torrent verified successfully.");
        }
        Command::Download { torrent } => {
            config.ensure_dirs()?;
            let store = Arc::new(JsonStore::open(&config.db_path).context("opening state store")?);
            download::download_torrent(Path::new(&torrent), &config, store)?;
        }
    }

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
