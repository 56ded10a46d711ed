use clap::{ArgAction, Parser, Subcommand};
use cloudsync_config::Overrides;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cloudsync", version)]
#[command(about = "Keep a local directory and an S3 bucket converged")]
pub struct Cli {
    /// Config file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "CLOUDSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local directory to sync, overriding `local.root`
    #[arg(long, global = true)]
    pub local: Option<PathBuf>,

    /// Remote root (`s3://bucket/prefix`), overriding `remote.url`
    #[arg(long, global = true)]
    pub remote: Option<String>,

    /// Seconds between cycles, overriding `sync.interval_secs`
    #[arg(long, global = true)]
    pub interval: Option<u64>,

    /// More logging (-v debug, -vv trace); `RUST_LOG` wins when set
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Sync continuously (the default)
    Run {
        /// Run a single cycle and exit; non-zero if any action failed
        #[arg(long)]
        once: bool,
    },
    /// Print every remote object
    ListRemote,
    /// Print every local file
    ListLocal,
    /// Print this machine's client identity
    Identity,
}

impl Cli {
    pub fn subcommand(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run { once: false })
    }

    pub fn overrides(&self) -> Overrides {
        Overrides {
            local_root: self.local.clone(),
            remote_url: self.remote.clone(),
            interval_secs: self.interval,
        }
    }

    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
