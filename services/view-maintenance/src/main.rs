//! View-maintenance service.
//!
//! Consumes the booking and carer event topics and keeps the staffing read
//! model in `PostgreSQL` current, one worker per partition, until Ctrl+C.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use staffing_view_maintenance::Config;
use staffing_views_postgres::DeadLetterQueue;
use staffing_views_projections::{
    LagTracker, PipelineHandles, PostgresOffsetStore, PostgresViewStore, ViewMaintenance,
    all_partitions,
};
use staffing_views_redpanda::RedpandaEventLog;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        consumer_group = %config.redpanda.consumer_group,
        topics = ?config.topics(),
        partitions_per_topic = config.redpanda.partitions_per_topic,
        "Configuration loaded"
    );

    info!("Connecting to view database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .min_connections(config.postgres.min_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .connect(&config.postgres.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let views = PostgresViewStore::new(pool.clone());
    views.migrate().await?;
    let dead_letters = DeadLetterQueue::new(pool.clone());
    dead_letters.migrate().await?;
    let offsets = PostgresOffsetStore::new(pool);
    info!("View database ready");

    let log = RedpandaEventLog::builder()
        .brokers(&config.redpanda.brokers)
        .consumer_group(&config.redpanda.consumer_group)
        .producer_acks(&config.redpanda.producer_acks)
        .fetch_timeout(Duration::from_millis(config.redpanda.fetch_timeout_ms))
        .build()?;

    let pending = dead_letters.count_pending().await?;
    if pending > 0 {
        warn!(pending, "Dead letters awaiting triage");
    }

    let handles = PipelineHandles {
        log: Arc::new(log),
        views: Arc::new(views),
        offsets: Arc::new(offsets),
        dead_letters: Arc::new(dead_letters),
        lag: LagTracker::new(),
    };
    let pipeline = ViewMaintenance::new(
        handles,
        all_partitions(config.redpanda.partitions_per_topic),
        config.pipeline_settings(),
    );

    if config.pipeline.rebuild_on_start {
        warn!("VIEW_REBUILD_ON_START set, replaying every partition from the beginning");
        pipeline.rebuild().await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    let outcome = pipeline.run(shutdown_rx).await;
    for report in &outcome.stopped {
        info!(
            partition = %report.partition,
            committed = ?report.committed,
            applied = report.applied,
            duplicates = report.duplicates,
            dead_lettered = report.dead_lettered,
            "Partition stopped"
        );
    }

    if outcome.is_clean() {
        info!("View maintenance shut down cleanly");
        Ok(())
    } else {
        for halted in &outcome.halted {
            error!(error = %halted, "Partition halted");
        }
        anyhow::bail!("{} partition(s) halted", outcome.halted.len())
    }
}
