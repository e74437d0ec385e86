// src/dispatch/sweeper.rs
//
// Server-side countdown: partners that sit on an offer past its expiry are
// excluded and the request moves on to the next nearest partner.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use super::store;
use crate::error::{db_error, ApiError};
use crate::models::AppState;

const SWEEP_BATCH: i64 = 100;

pub fn spawn(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(every_secs = every.as_secs(), "offer expiry sweeper started");

        loop {
            ticker.tick().await;
            match sweep_once(&state).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(reassigned = n, "expired offers swept"),
                Err(e) => tracing::warn!(error = ?e, "offer expiry sweep failed"),
            }
        }
    })
}

/// Handles one batch of expired offers. Returns how many were reassigned.
pub async fn sweep_once(state: &AppState) -> Result<usize, ApiError> {
    let due: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT booking_id
        FROM ambulance_request
        WHERE status IN ('requested', 'rejected & reassigned')
          AND offer_expires_at IS NOT NULL
          AND offer_expires_at <= now()
        ORDER BY offer_expires_at ASC
        LIMIT $1
        "#,
    )
    .bind(SWEEP_BATCH)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    let mut reassigned = 0;
    for booking_id in due {
        match expire_one(state, &booking_id).await {
            Ok(true) => reassigned += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(booking_id = %booking_id, error = ?e, "expiry failed"),
        }
    }
    Ok(reassigned)
}

/// Expires the offer on one booking if it is due. Shared with the explicit
/// `/expire` endpoint; a live or already-moved offer is a no-op.
pub async fn expire_one(state: &AppState, booking_id: &str) -> Result<bool, ApiError> {
    let mut tx = state.db.begin().await.map_err(db_error)?;

    let req = store::lock_request(&mut *tx, booking_id).await?;
    let outcome = store::expire_if_due(&mut *tx, &req, state.dispatch, Utc::now()).await?;

    tx.commit().await.map_err(db_error)?;

    match outcome {
        Some(out) => {
            store::notify_routing(state.notifier.as_ref(), &out, &req).await;
            Ok(true)
        }
        None => Ok(false),
    }
}
