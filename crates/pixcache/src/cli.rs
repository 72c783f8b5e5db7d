//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pixcache_service::caching::{DiskStore, ResourceKey};
use pixcache_service::config::Config;
use pixcache_service::dispatch::channel_context;
use pixcache_service::loader::{ImageLoader, LoadStatus};
use pixcache_service::logging;
use pixcache_service::metrics;

use crate::slot::ConsoleSlot;

/// Pixcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load images through the cache and report how each one was resolved.
    Load {
        /// The keys of the images to load.
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Remove images from the durable store.
    Evict {
        /// The keys of the images to remove.
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Remove writes that were staged but never promoted.
    ClearTmp,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "pixcache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is not started yet. The only other thread is the Sentry transport,
    // which reads its environment while `sentry::init` builds it and not afterwards.
    unsafe { logging::init_logging(&config.logging) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Load { keys } => load(&config, &keys).context("failed to load images")?,
        Command::Evict { keys } => evict(&config, &keys).context("failed to evict images")?,
        Command::ClearTmp => clear_tmp(&config).context("failed to clear staged writes")?,
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<DiskStore> {
    let cache_dir = config
        .cache_dir
        .as_ref()
        .context("no cache_dir configured")?;
    DiskStore::open(cache_dir)
        .with_context(|| format!("failed to open image store at {}", cache_dir.display()))
}

fn load(config: &Config, keys: &[String]) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("pixcache-worker")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    let (context, receiver) = channel_context();
    let loader = ImageLoader::from_config(config, runtime.handle().clone(), context)?;

    let loads: Vec<_> = keys
        .iter()
        .map(|key| {
            let slot = ConsoleSlot::new(key);
            let status = loader.load(slot.clone(), key);
            (slot, status)
        })
        .collect();

    // Every unit holds on to the loader, so the receiver runs dry once the last one is done.
    drop(loader);
    runtime.block_on(receiver.run());

    let mut failed = 0;
    for (slot, status) in &loads {
        if *status != LoadStatus::Ignored && slot.image().is_none() {
            failed += 1;
        }
        println!("{}", slot.describe(*status));
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} images could not be loaded", loads.len());
    }
    Ok(())
}

fn evict(config: &Config, keys: &[String]) -> Result<()> {
    let store = open_store(config)?;
    for key in keys.iter().filter_map(ResourceKey::new) {
        if store.remove(&key)? {
            println!("evicted {key}");
        } else {
            println!("not cached {key}");
        }
    }
    Ok(())
}

fn clear_tmp(config: &Config) -> Result<()> {
    open_store(config)?.clear_tmp()?;
    Ok(())
}
