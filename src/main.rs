use std::time::Duration;

use async_trait::async_trait;

use studio_jobs::config::RuntimeConfig;
use studio_jobs::error::WorkerError;
use studio_jobs::router::{EnvelopeKind, JobType, ProgressUpdate, Router, mailbox};
use studio_jobs::worker::{ContinuousWorker, Job, JobHandler, PooledWorker, Worker, WorkerContext};

const PROGRESS_WIDGET: &str = "JobProgressWidget";

/// Pretends to crop faces out of one frame.
fn crop_frame(frame: usize) -> anyhow::Result<usize> {
    std::thread::sleep(Duration::from_millis(150));
    if frame == 3 {
        anyhow::bail!("no face found in frame {frame}");
    }
    Ok(frame * 2)
}

struct Scraper;

#[async_trait]
impl JobHandler for Scraper {
    async fn handle(&mut self, job: &Job, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        let query = job
            .get_str("query")
            .ok_or_else(|| anyhow::anyhow!("job {} has no query", job.id))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        tracing::info!(query, "Scraped images");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RuntimeConfig::load()?;

    eprintln!("Studio Jobs v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Executors: {}", config.pool.executors);
    eprintln!("   Harvest order: {:?}", config.pool.harvest_order);
    eprintln!("   Poll interval: {:?}\n", config.continuous.poll_interval);

    let (router, router_task) = Router::spawn();

    // Stand-in for the progress widget: print whatever reaches it.
    let (widget_tx, mut widget_rx) = mailbox();
    router.register(PROGRESS_WIDGET, widget_tx)?;
    let widget = tokio::spawn(async move {
        while let Some(envelope) = widget_rx.recv().await {
            match (envelope.kind(), ProgressUpdate::from_envelope(&envelope)) {
                (EnvelopeKind::Answer, Some(update)) => eprintln!(
                    "   [{}] {}/{}{}",
                    update.job_name,
                    update.part + 1,
                    update.total,
                    if update.finished { " done" } else { "" }
                ),
                (kind, _) => eprintln!(
                    "   [{}] {:?} {}",
                    envelope.sender(),
                    kind,
                    envelope
                        .status()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                ),
            }
        }
    });

    let frames = (0..6).map(|frame| move || crop_frame(frame));
    let pooled = PooledWorker::new("crop-faces", JobType::CropFaces, frames)
        .with_config(config.pool);
    let batch = Worker::new(pooled, Some(router.clone()), Some(PROGRESS_WIDGET.into())).spawn();

    let scraper = Worker::new(
        ContinuousWorker::new("scraper", JobType::ScrapeImages, Scraper)
            .with_config(config.continuous),
        Some(router.clone()),
        Some(PROGRESS_WIDGET.into()),
    );
    let submitter = scraper.submitter()?;
    let scraper = scraper.spawn();
    for query in ["portrait", "profile", "landscape"] {
        submitter.submit(Job::new().with_field("query", query))?;
    }
    submitter.submit(Job::new())?;

    let report = batch.join().await?;
    if let Some(batch) = &report.output {
        eprintln!(
            "\n   Batch: {} completed, {} failed",
            batch.completed(),
            batch.failed()
        );
    }

    // Let the queue drain, then stop the service loop.
    tokio::time::sleep(Duration::from_millis(600)).await;
    submitter.request_cancel();
    let service = scraper.join().await?;
    if let Some(counts) = service.output {
        eprintln!(
            "   Scraper: {} processed, {} failed",
            counts.processed, counts.failed
        );
    }

    router.unregister(PROGRESS_WIDGET)?;
    drop(submitter);
    drop(router);
    let stats = router_task.await?;
    widget.await?;
    eprintln!(
        "   Router: {} delivered, {} dropped",
        stats.delivered, stats.dropped
    );

    Ok(())
}
