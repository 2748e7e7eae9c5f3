use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "flock", version, about = "Cluster membership for a fleet of servers")]
pub struct Cli {
    /// Data directory (identity, state, logs, config.toml)
    #[arg(long, env = "FLOCK_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Admin socket path (default: <data-dir>/unix.socket)
    #[arg(long, env = "FLOCK_SOCKET", global = true)]
    pub socket: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "FLOCK_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to file (in addition to stderr)
    #[arg(long, env = "FLOCK_LOG_FILE", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon (admin socket, HTTPS listener, heartbeats)
    Daemon,
    /// Show version information
    Version,
    /// Cluster membership
    Cluster(ClusterCommand),
    /// Server configuration
    Config(ConfigCommand),
    /// Trusted client certificates
    Trust(TrustCommand),
}

#[derive(Args, Debug)]
pub struct ClusterCommand {
    #[command(subcommand)]
    pub command: ClusterSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum ClusterSubcommand {
    /// Show this server's cluster status
    Show,
    /// List cluster members
    List,
    /// Create a new cluster with this server as its first member
    Bootstrap {
        /// Member name for this server
        name: String,
    },
    /// Join an existing cluster
    Join {
        /// Member name for this server
        name: String,
        /// Address (host:port) of an existing member
        #[arg(long)]
        address: String,
        /// PEM file holding that member's server certificate
        #[arg(long, value_name = "PATH")]
        certificate: PathBuf,
    },
    /// Rename a member
    Rename {
        name: String,
        new_name: String,
    },
    /// Remove a member from the cluster
    Remove {
        name: String,
        /// Remove even if the member is the only holder of some images
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Show the server configuration
    Show,
    /// Set (or, with an empty value, unset) configuration keys
    Set {
        /// KEY=VALUE pairs
        #[arg(required = true, value_name = "KEY=VALUE")]
        pairs: Vec<String>,
    },
}

#[derive(Args, Debug)]
pub struct TrustCommand {
    #[command(subcommand)]
    pub command: TrustSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum TrustSubcommand {
    /// Trust a client certificate
    Add {
        /// PEM certificate file
        certificate: PathBuf,
        /// Display name (default: fingerprint prefix)
        #[arg(long)]
        name: Option<String>,
    },
    /// List trusted certificates
    List,
    /// Remove a trusted certificate
    Remove {
        fingerprint: String,
    },
}
