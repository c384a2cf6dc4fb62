use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use leash_core::{
    FetcherOptions, HandlerError, JobFetcher, JobHandler, JobId, LeasedJob, QueueName, QueueStore,
    SqliteQueueStore, WorkerGroup,
};

#[derive(Parser, Debug)]
#[command(
    name = "leash",
    about = "Run a SQLite-backed job queue with fetch leases end to end"
)]
struct Args {
    /// sqlx SQLite URL, e.g. sqlite://leash.db
    #[arg(long, default_value = "sqlite::memory:")]
    database_url: String,
    /// Number of concurrent workers
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Number of jobs to enqueue before the workers start
    #[arg(long, default_value_t = 20)]
    jobs: usize,
    #[arg(long, default_value = QueueName::DEFAULT)]
    queue: String,
    /// Probability (0.0..=1.0) that a job attempt fails and is requeued
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,
    /// JSON file with fetcher options; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Reclaim leases older than this many seconds
    #[arg(long)]
    invisibility_timeout_secs: Option<u64>,
    /// Give up waiting for the queue to drain after this many seconds
    #[arg(long, default_value_t = 60)]
    wait_timeout_secs: u64,
}

impl Args {
    fn fetcher_options(&self) -> Result<FetcherOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => FetcherOptions::default(),
        };
        if let Some(ms) = self.poll_interval_ms {
            options.poll_interval_ms = ms;
        }
        if self.invisibility_timeout_secs.is_some() {
            options.invisibility_timeout_secs = self.invisibility_timeout_secs;
        }
        Ok(options)
    }
}

/// Sleeps a little per job and fails at the configured rate.
struct DemoHandler {
    failure_rate: f64,
    succeeded: AtomicU32,
    failed: AtomicU32,
}

#[async_trait]
impl JobHandler for DemoHandler {
    async fn handle(&self, job: LeasedJob) -> Result<(), HandlerError> {
        let work_ms = 5 + rand::random::<u64>() % 20;
        sleep(Duration::from_millis(work_ms)).await;

        if rand::random::<f64>() < self.failure_rate {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return Err(format!("simulated failure for {}", job.job_id).into());
        }
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %job.job_id, queue = %job.queue, "job done");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let args = Args::parse();
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.failure_rate),
        "--failure-rate must be within 0.0..=1.0"
    );
    let options = args.fetcher_options()?;
    let queue = QueueName::new(args.queue.clone())?;

    let store = Arc::new(
        SqliteQueueStore::connect(&args.database_url)
            .await?
            .with_invisibility_timeout(options.invisibility_timeout()),
    );
    let fetcher = JobFetcher::new(store.clone(), store.clone(), options);

    for _ in 0..args.jobs {
        fetcher.enqueue(&queue, JobId::generate()).await?;
    }
    info!(jobs = args.jobs, %queue, "enqueued");

    let handler = Arc::new(DemoHandler {
        failure_rate: args.failure_rate,
        succeeded: AtomicU32::new(0),
        failed: AtomicU32::new(0),
    });
    let group = WorkerGroup::spawn(args.workers, fetcher, vec![queue.clone()], handler.clone())?;

    let drained = async {
        loop {
            match store.counts(&queue).await {
                Ok(counts) if counts.total() == 0 => break,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "cannot read queue counts"),
            }
            sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::select! {
        _ = drained => info!("queue drained"),
        _ = sleep(Duration::from_secs(args.wait_timeout_secs)) => info!("gave up waiting for the queue to drain"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    group.shutdown_and_join().await;

    let counts = store.counts(&queue).await?;
    println!(
        "succeeded={} failed_attempts={} visible={} leased={}",
        handler.succeeded.load(Ordering::Relaxed),
        handler.failed.load(Ordering::Relaxed),
        counts.visible,
        counts.leased,
    );
    Ok(())
}
