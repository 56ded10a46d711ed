//! cloudsync: keep a local directory and a remote blob store converged.
//!
//! Loads the configuration, works out this machine's identity, opens both
//! replicas and then either runs the sync loop until Ctrl+C / SIGTERM or
//! performs one of the one-shot inspection commands.

mod cli;
mod error;

use crate::cli::{Cli, Command};
use crate::error::{ErrorKind, Result};
use clap::Parser;
use cloudsync_config::{Config, OnFailure};
use cloudsync_engine::identity::{self, SysfsInterfaces};
use cloudsync_engine::{Executor, FailurePolicy, Syncer, Trash};
use cloudsync_storage::backend::S3Backend;
use cloudsync_storage::{Backend, BackendHandle, ClientId, LocalTree, validate_path};
use exn::ResultExt;
use futures::TryStreamExt;
use std::process::ExitCode;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let overrides = cli.overrides();
    let config_path = cli.config.as_deref();
    match cli.subcommand() {
        Command::Identity => {
            let config = Config::load_unvalidated(config_path, &overrides).or_raise(|| ErrorKind::Config)?;
            println!("{}", client_id(&config)?);
            Ok(ExitCode::SUCCESS)
        },
        Command::ListLocal => {
            let config = Config::load(config_path, &overrides).or_raise(|| ErrorKind::Config)?;
            let local = LocalTree::new(&config.local.root).or_raise(|| ErrorKind::Storage)?;
            let exclude: Vec<_> = trash(&config)?.local_exclude(local.root()).into_iter().collect();
            let mut entries = local.list_stream(&exclude);
            while let Some(entry) = entries.try_next().await.or_raise(|| ErrorKind::Storage)? {
                println!("{}\t{}\t{}", timestamp(entry.modified), entry.fingerprint, entry.path.display());
            }
            Ok(ExitCode::SUCCESS)
        },
        Command::ListRemote => {
            let config = Config::load(config_path, &overrides).or_raise(|| ErrorKind::Config)?;
            let backend = open_backend(&config).await?;
            let mut entries = backend.list_stream();
            while let Some(entry) = entries.try_next().await.or_raise(|| ErrorKind::Storage)? {
                let writer = entry.writer.as_ref().map_or("-", ClientId::as_str);
                println!("{}\t{}\t{}\t{}", timestamp(entry.modified), entry.fingerprint, writer, entry.path.display());
            }
            Ok(ExitCode::SUCCESS)
        },
        Command::Run { once } => {
            let config = Config::load(config_path, &overrides).or_raise(|| ErrorKind::Config)?;
            let mut syncer = syncer(&config).await?;
            if once {
                let report = syncer.run_once().await.or_raise(|| ErrorKind::Sync)?;
                return Ok(match report.is_success() {
                    true => ExitCode::SUCCESS,
                    false => ExitCode::FAILURE,
                });
            }
            tokio::select! {
                () = syncer.run() => {},
                () = shutdown_signal() => tracing::info!("shutting down"),
            }
            Ok(ExitCode::SUCCESS)
        },
    }
}

fn client_id(config: &Config) -> Result<ClientId> {
    identity::resolve(config.identity.client_id.as_deref(), &SysfsInterfaces::default())
        .or_raise(|| ErrorKind::Identity)
}

fn trash(config: &Config) -> Result<Trash> {
    let remote = config.remote.trash_prefix.as_deref().map(validate_path).transpose().or_raise(|| ErrorKind::Config)?;
    Ok(Trash {
        local: config.local_trash(),
        remote,
    })
}

async fn open_backend(config: &Config) -> Result<BackendHandle> {
    let location = config.remote.location().or_raise(|| ErrorKind::Config)?;
    let backend = S3Backend::new(
        config.remote.url.clone(),
        location.bucket,
        location.prefix,
        config.remote.region.clone(),
        config.remote.endpoint.clone(),
        config.remote.key_id.clone().unwrap_or_default(),
        config.remote.key_secret.clone().unwrap_or_default(),
    )
    .await
    .or_raise(|| ErrorKind::Storage)?;
    Ok(Arc::new(backend))
}

async fn syncer(config: &Config) -> Result<Syncer> {
    let client_id = client_id(config)?;
    let local = LocalTree::new(&config.local.root).or_raise(|| ErrorKind::Storage)?;
    let backend = open_backend(config).await?;
    let policy = match config.sync.on_failure {
        OnFailure::Abort => FailurePolicy::AbortOnFirst,
        OnFailure::Continue => FailurePolicy::ContinueAll,
    };
    tracing::info!(
        client_id = %client_id,
        local = %local.root().display(),
        remote = %config.remote.url,
        "starting cloudsync"
    );
    let executor = Executor::new(backend, local, client_id).with_policy(policy).with_trash(trash(config)?);
    Ok(Syncer::new(executor, config.interval()))
}

fn timestamp(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::warn!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
