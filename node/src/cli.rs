//! # CLI Interface
//!
//! Command-line arguments for `kestrel-node`, built with `clap` derive.
//! Every `run` flag can also come from a `KESTREL_*` environment variable,
//! and flags override values loaded from the config file.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kestrel_protocol::config::{BootstrapPeer, DEFAULT_CONTROL_PORT, DEFAULT_METRICS_PORT, DEFAULT_P2P_PORT};

use crate::logging::LogFormat;

/// Kestrel peer-to-peer node.
#[derive(Parser, Debug)]
#[command(name = "kestrel-node", about = "Kestrel peer-to-peer node", version, propagate_version = true)]
pub struct KestrelCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and a node identity key.
    Init(InitArgs),
    /// Ask a running node for its status over the control channel.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSON config file. Flags given here override its values.
    #[arg(long, short = 'c', env = "KESTREL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the chain database and the node key.
    #[arg(long, short = 'd', env = "KESTREL_DATA_DIR", default_value = ".kestrel")]
    pub data_dir: PathBuf,

    /// Interface the P2P listener binds to.
    #[arg(long, env = "KESTREL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "KESTREL_P2P_PORT", default_value_t = DEFAULT_P2P_PORT)]
    pub p2p_port: u16,

    /// Loopback port of the encrypted control channel.
    #[arg(long, env = "KESTREL_CONTROL_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    pub control_port: u16,

    /// Port serving `/metrics`, `/health` and `/status`.
    #[arg(long, env = "KESTREL_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Address other peers should dial, e.g. `203.0.113.7:7340`. Setting it
    /// marks the node as public.
    #[arg(long, env = "KESTREL_ADVERTISE")]
    pub advertise: Option<String>,

    /// Peers to start from, as `<peer id>@<host:port>`. Repeat the flag or
    /// separate entries with commas.
    #[arg(long = "bootstrap", short = 'b', env = "KESTREL_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap: Vec<BootstrapPeer>,

    /// Hex-encoded Ed25519 secret key. Defaults to `node.key` in the data
    /// directory, generated on first run.
    #[arg(long, env = "KESTREL_NODE_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Mine blocks.
    #[arg(long, env = "KESTREL_MINE")]
    pub mine: bool,

    #[arg(long, env = "KESTREL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    #[arg(long, short = 'd', env = "KESTREL_DATA_DIR", default_value = ".kestrel")]
    pub data_dir: PathBuf,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Control channel address of the running node.
    #[arg(long, env = "KESTREL_CONTROL_ADDR", default_value_t = format!("127.0.0.1:{DEFAULT_CONTROL_PORT}"))]
    pub control: String,
}
