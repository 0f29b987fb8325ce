//! Command-line surface; every flag overrides the matching config field

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::checksum::DigestAlgorithm;
use crate::config::BenchConfig;
use crate::strategy::Strategy;
use crate::tls::CipherPolicy;

#[derive(Debug, Parser)]
#[command(author, version, about = "Encrypted file transfer benchmark with kernel TLS offload")]
pub struct Cli {
    /// TOML file with defaults for any option below
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run server and client in this process
    Run(BenchOpts),
    /// Send the source file to each connecting client
    Serve(BenchOpts),
    /// Receive and verify from a remote server
    Fetch(BenchOpts),
}

impl Command {
    pub fn opts(&self) -> &BenchOpts {
        match self {
            Command::Run(o) | Command::Serve(o) | Command::Fetch(o) => o,
        }
    }
}

#[derive(Clone, Debug, Default, Args)]
pub struct BenchOpts {
    /// Source file to send (server) or compare against (client)
    pub source: Option<PathBuf>,

    /// Server IPv4 address
    #[arg(long)]
    pub host: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    /// Verify against this file instead of the source
    #[arg(long)]
    pub reference: Option<PathBuf>,

    /// Temporary file for each received copy
    #[arg(long)]
    pub temp: Option<PathBuf>,

    /// Number of transfer rounds
    #[arg(short = 'n', long)]
    pub rounds: Option<u32>,

    /// Install the session keys into kernel TLS after the handshake
    #[arg(long)]
    pub offload: bool,

    /// No TLS at all
    #[arg(long, conflicts_with = "offload")]
    pub plaintext: bool,

    #[arg(short, long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Bytes moved per iteration
    #[arg(long)]
    pub chunk_size: Option<usize>,

    #[arg(long, value_enum)]
    pub digest: Option<DigestAlgorithm>,

    #[arg(long, value_enum)]
    pub cipher: Option<CipherPolicy>,

    /// Server certificate (PEM); generated self-signed if missing
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long)]
    pub key: Option<PathBuf>,
}

impl BenchOpts {
    pub fn apply(&self, cfg: &mut BenchConfig) {
        if let Some(v) = &self.source {
            cfg.source = v.clone();
        }
        if let Some(v) = &self.host {
            cfg.host = v.clone();
        }
        if let Some(v) = self.port {
            cfg.port = v;
        }
        if let Some(v) = &self.reference {
            cfg.reference = Some(v.clone());
        }
        if let Some(v) = &self.temp {
            cfg.temp = v.clone();
        }
        if let Some(v) = self.rounds {
            cfg.rounds = v;
        }
        cfg.offload |= self.offload;
        cfg.plaintext |= self.plaintext;
        if let Some(v) = self.strategy {
            cfg.strategy = v;
        }
        if let Some(v) = self.chunk_size {
            cfg.chunk_size = v;
        }
        if let Some(v) = self.digest {
            cfg.digest = v;
        }
        if let Some(v) = self.cipher {
            cfg.cipher = v;
        }
        if let Some(v) = &self.cert {
            cfg.cert = v.clone();
        }
        if let Some(v) = &self.key {
            cfg.key = v.clone();
        }
    }
}
