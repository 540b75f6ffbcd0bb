//! CDC bridge (spec.md §4.G). The source system tails a MySQL binlog
//! via Canal; the pack has no equivalent pure-Rust binlog client, so
//! this bridge polls the Postgres `outbox` table instead and publishes
//! to the same `canal-outbox` topic. It is the outbox-polling variant
//! of the same CDC-bridge responsibility, not a different component.
//! `SELECT ... FOR UPDATE SKIP LOCKED` lets multiple bridge instances
//! run without double-publishing a row.

use rdkafka::producer::FutureProducer;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::warn;

use crate::bus;
use crate::config::CdcSettings;
use crate::db::OutboxRow;
use crate::error::Result;

pub async fn run(producer: FutureProducer, db: PgPool, settings: CdcSettings, running: Arc<AtomicBool>) {
    if !settings.enabled {
        return;
    }
    let mut ticker = interval(Duration::from_millis(settings.interval_ms));
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        if let Err(e) = poll_once(&producer, &db, settings.batch_size).await {
            warn!("cdc poll failed: {e}");
        }
    }
}

async fn poll_once(producer: &FutureProducer, db: &PgPool, batch_size: i64) -> Result<()> {
    let mut tx = db.begin().await.map_err(crate::error::EngageFeedError::Database)?;

    let rows: Vec<OutboxRow> = sqlx::query_as(
        "SELECT id, aggregate_type, aggregate_id, type, payload, created_at, published_at FROM outbox \
         WHERE published_at IS NULL ORDER BY id ASC LIMIT $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(batch_size)
    .fetch_all(&mut *tx)
    .await
    .map_err(crate::error::EngageFeedError::Database)?;

    for row in &rows {
        // Skip-ack-on-error: a publish failure leaves published_at NULL so the
        // next poll retries this row; we do not advance past it.
        if let Err(e) = bus::publish(producer, bus::TOPIC_CANAL_OUTBOX, &row.aggregate_id, &row.payload).await {
            warn!("cdc publish failed for outbox row {}: {e}", row.id);
            tx.rollback().await.map_err(crate::error::EngageFeedError::Database)?;
            return Ok(());
        }
    }

    if !rows.is_empty() {
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        sqlx::query("UPDATE outbox SET published_at = now() WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(crate::error::EngageFeedError::Database)?;
    }

    tx.commit().await.map_err(crate::error::EngageFeedError::Database)?;
    Ok(())
}
