//! mbox-agent: wires the TCP core, reframer, and NIC scheduler into a
//! running thread-per-queue pipeline.
//!
//! Startup sequence and CLI/logging shape grounded on
//! `strata-agent/src/main.rs`'s non-async portions (its control-plane
//! WebSocket loop is `#[tokio::main]`; this binary deliberately has no
//! async runtime at all, since every wait on this path is a timer
//! reschedule rather than an I/O future — see `SPEC_FULL.md` §9).

mod config;
mod pipeline;

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::bounded;
use mbox_nicsched::{NicScheduler, NullListener};
use tracing_subscriber::EnvFilter;

use config::AgentConfig;
use pipeline::{spawn_queue, NullSink, QueueHandle};

/// Transparent TCP middlebox agent.
#[derive(Parser, Debug)]
#[command(name = "mbox-agent", about = "Transparent TCP middlebox agent")]
struct Cli {
    /// Path to a TOML configuration file. Missing keys fall back to defaults.
    #[arg(long, default_value = "mbox-agent.toml")]
    config: PathBuf,

    /// Print the effective configuration and exit without starting the pipeline.
    #[arg(long, default_value_t = false)]
    print_config: bool,

    /// Number of worker queues, overriding the config file's `queues` key.
    #[arg(long)]
    queues: Option<usize>,

    /// Increase log verbosity (-v for debug, -vv for trace). Ignored if
    /// `RUST_LOG` is set.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity (-q for warn, -qq for error). Ignored if
    /// `RUST_LOG` is set.
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    quiet: u8,
}

/// Net verbosity (`-v` counts up, `-q` counts down from `info`) as a level
/// name `EnvFilter` understands.
fn verbosity_level(verbose: u8, quiet: u8) -> &'static str {
    match verbose as i16 - quiet as i16 {
        i16::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<AgentConfig> {
    match fs::read_to_string(path) {
        Ok(text) => AgentConfig::from_toml_str(&text)
            .with_context(|| format!("invalid configuration in {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "no config file found, using defaults");
            Ok(AgentConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

/// Periodically ticks the NIC scheduler. Real deployments feed it live
/// per-core and per-bucket load samples from the NIC driver; this binary
/// has no such driver integration (DPDK secondary-process orchestration is
/// out of scope, per `SPEC_FULL.md`'s Non-goals), so it ticks against a
/// flat, unchanging load snapshot purely to exercise the control loop.
fn spawn_nicsched_thread(cfg: mbox_nicsched::NicSchedulerConfig, n_buckets: usize, n_cores: usize) -> QueueHandleLike {
    let (tx, rx) = bounded::<()>(1);
    let handle = std::thread::Builder::new()
        .name("mbox-nicsched".into())
        .spawn(move || {
            let mut sched = NicScheduler::new(cfg, n_buckets, n_cores);
            let flat_load = vec![0.0f64; n_cores];
            let bucket_load: std::collections::HashMap<usize, f64> =
                (0..n_buckets).map(|b| (b, 0.0)).collect();
            loop {
                match rx.recv_timeout(sched.tick()) {
                    Ok(()) => break,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        sched.tick_once(&flat_load, &bucket_load, &mut NullListener);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .expect("failed to spawn nicsched thread");
    QueueHandleLike { _stop: tx, handle: Some(handle) }
}

struct QueueHandleLike {
    _stop: crossbeam_channel::Sender<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Drop for QueueHandleLike {
    fn drop(&mut self) {
        let _ = self._stop.send(());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(verbosity_level(cli.verbose, cli.quiet))
        }))
        .init();

    let mut cfg = load_config(&cli.config)?;
    if let Some(queues) = cli.queues {
        cfg.queues = queues;
    }
    cfg.validate().context("invalid configuration after applying --queues")?;

    if cli.print_config {
        println!("{cfg:#?}");
        return Ok(());
    }

    tracing::info!(queues = cfg.queues, "starting mbox-agent");

    const N_BUCKETS: usize = 256;
    let _nicsched = spawn_nicsched_thread(cfg.nicsched.clone(), N_BUCKETS, cfg.queues);

    let mut queues: Vec<QueueHandle> = (0..cfg.queues)
        .map(|i| spawn_queue(format!("mbox-worker-{i}"), cfg.channel_capacity, cfg.sfmaker.clone(), NullSink))
        .collect();

    tracing::info!(workers = queues.len(), "pipeline running, awaiting shutdown signal");

    // In production this loop polls a NIC receive queue and routes each
    // packet to `queues[hash(five_tuple) % queues.len()]`. No such NIC
    // source exists in this workspace (see the crate's NIC I/O non-goal),
    // so the agent idles here until terminated.
    let (_shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let _ = shutdown_rx.recv();

    for queue in queues.iter_mut() {
        queue.shutdown();
    }

    Ok(())
}
