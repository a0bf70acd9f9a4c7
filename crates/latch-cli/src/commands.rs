//! Command implementations for the Latch CLI.

use crate::output;
use anyhow::{Context, Result, bail};
use indicatif::ProgressBar;
use latch_core::config::LatchConfig;
use latch_store::{MemoryStore, SessionStateProvider, SessionStore, StoreStatistics};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Item holding the shared counter in the contended session
const COUNTER_KEY: &str = "counter";

/// Session timeout used for the contended record
const SESSION_TIMEOUT: i32 = 20;

/// Load the configuration at `path`, or defaults plus environment overrides
/// when the file does not exist
pub async fn load_config(path: &Path) -> Result<LatchConfig> {
    if tokio::fs::try_exists(path).await? {
        return LatchConfig::load_from_path(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()));
    }

    debug!("No configuration at {}, using defaults", path.display());
    let mut config = LatchConfig::default();
    config.merge_env_vars()?;
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Config
// ============================================================================

/// Write a default configuration file
pub async fn config_init(path: &Path, force: bool) -> Result<()> {
    if tokio::fs::try_exists(path).await? {
        if !force {
            bail!(
                "Configuration already exists at {} (use --force to overwrite)",
                path.display()
            );
        }
        output::warning(format!("Overwriting {}", path.display()));
    }

    LatchConfig::default().save_to_path(path).await?;
    output::success(format!("Configuration written to {}", path.display()));
    Ok(())
}

/// Print the effective configuration
pub async fn config_show(path: &Path, config: &LatchConfig) -> Result<()> {
    output::header("Configuration");
    output::kv("path", path.display());
    output::kv("exists", tokio::fs::try_exists(path).await?);
    println!();
    print!("{}", config.export_toml()?);
    Ok(())
}

// ============================================================================
// Contend
// ============================================================================

/// Outcome of a contention run
#[derive(Debug, Clone)]
pub struct ContentionReport {
    pub clients: usize,
    pub rounds: usize,
    /// Counter value read back after all clients finished
    pub counter: u64,
    /// Lock attempts that found the record locked
    pub contended: u64,
    pub elapsed: Duration,
    pub stats: StoreStatistics,
}

impl ContentionReport {
    pub fn expected(&self) -> u64 {
        (self.clients * self.rounds) as u64
    }

    pub fn lost_updates(&self) -> u64 {
        self.expected().saturating_sub(self.counter)
    }
}

/// Run `clients` threads that each increment a counter in one session
/// `rounds` times, retrying whenever the record is locked.
pub fn run_contention(
    config: &LatchConfig,
    session_id: &str,
    clients: usize,
    rounds: usize,
    progress: Option<ProgressBar>,
) -> Result<ContentionReport> {
    let store = Arc::new(MemoryStore::from_config(config.store()));
    let provider = Arc::new(SessionStateProvider::from_config(
        Arc::clone(&store),
        config.provider(),
    ));

    let mut record = provider.create_new_store_data(SESSION_TIMEOUT);
    record.items_mut().set(COUNTER_KEY, 0u64.to_le_bytes().to_vec());
    provider.set_and_release_item_exclusive(session_id, record, 0, true)?;

    info!(
        "Starting contention run: {} clients x {} rounds on '{}'",
        clients, rounds, session_id
    );

    let contended = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let handles: Vec<_> = (0..clients)
        .map(|client| {
            let provider = Arc::clone(&provider);
            let contended = Arc::clone(&contended);
            let progress = progress.clone();
            let session_id = session_id.to_string();

            thread::spawn(move || -> Result<()> {
                for _ in 0..rounds {
                    increment(&provider, &session_id, &contended)?;
                    if let Some(pb) = &progress {
                        pb.inc(1);
                    }
                }
                debug!("Client {} finished", client);
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => bail!("Contention client panicked"),
        }
    }

    let elapsed = started.elapsed();
    let lookup = provider.get_item(session_id);
    let record = lookup
        .record
        .context("Session record missing or still locked after the run")?;

    Ok(ContentionReport {
        clients,
        rounds,
        counter: read_counter(record.items().get(COUNTER_KEY))?,
        contended: contended.load(Ordering::Relaxed),
        elapsed,
        stats: store.statistics(),
    })
}

/// Lock, bump the counter and release, retrying until the lock is granted
fn increment<S: SessionStore>(
    provider: &SessionStateProvider<S>,
    session_id: &str,
    contended: &AtomicU64,
) -> Result<()> {
    let mut backoff = Duration::from_micros(10);

    loop {
        let lookup = provider.get_item_exclusive(session_id)?;

        let Some(mut record) = lookup.record else {
            if !lookup.locked {
                bail!("Session '{}' disappeared", session_id);
            }
            contended.fetch_add(1, Ordering::Relaxed);
            thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(2));
            continue;
        };

        let counter = read_counter(record.items().get(COUNTER_KEY))?;
        record
            .items_mut()
            .set(COUNTER_KEY, (counter + 1).to_le_bytes().to_vec());

        provider.set_and_release_item_exclusive(session_id, record, lookup.lock_id, false)?;
        return Ok(());
    }
}

fn read_counter(raw: Option<&[u8]>) -> Result<u64> {
    let raw = raw.context("Counter item missing")?;
    let bytes: [u8; 8] = raw
        .try_into()
        .with_context(|| format!("Counter item has {} bytes, expected 8", raw.len()))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Run the contention demo and print its report
pub async fn contend(
    config: LatchConfig,
    session_id: String,
    clients: usize,
    rounds: usize,
) -> Result<()> {
    if clients == 0 || rounds == 0 {
        bail!("--clients and --rounds must both be positive");
    }

    output::info(format!(
        "{} clients x {} rounds on session '{}'",
        clients, rounds, session_id
    ));

    let progress = output::progress_bar((clients * rounds) as u64);
    let report = {
        let progress = progress.clone();
        tokio::task::spawn_blocking(move || {
            run_contention(&config, &session_id, clients, rounds, Some(progress))
        })
        .await??
    };
    progress.finish_and_clear();

    output::header("Contention Report");
    output::kv("updates expected", report.expected());
    output::kv("counter", report.counter);
    output::kv("contended attempts", report.contended);
    output::kv("store invocations", report.stats.invocations);
    output::kv("store commits", report.stats.commits);
    output::kv("store failures", report.stats.failures);
    output::kv("elapsed", format!("{:.2?}", report.elapsed));

    if report.lost_updates() > 0 {
        bail!("{} updates were lost", report.lost_updates());
    }

    output::success("No updates lost");
    Ok(())
}
