// src/notify.rs
//
// Push-style notices for partners and drivers. Clients poll their inbox;
// delivery failures never roll back the dispatch operation that caused them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RequestOffered,
    RequestReassigned,
    DriverAssigned,
    RequestCancelled,
    OfferWithdrawn,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::RequestOffered => "request_offered",
            NotificationKind::RequestReassigned => "request_reassigned",
            NotificationKind::DriverAssigned => "driver_assigned",
            NotificationKind::RequestCancelled => "request_cancelled",
            NotificationKind::OfferWithdrawn => "offer_withdrawn",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient_user_id: Uuid,
        kind: NotificationKind,
        payload: JsonValue,
    ) -> anyhow::Result<()>;
}

/// Persists notices into the `notification` table.
pub struct PgNotifier {
    db: PgPool,
}

impl PgNotifier {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn notify(
        &self,
        recipient_user_id: Uuid,
        kind: NotificationKind,
        payload: JsonValue,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification (recipient_user_id, kind, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(recipient_user_id)
        .bind(kind.as_str())
        .bind(&payload)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

pub async fn notify_best_effort(
    notifier: &dyn Notifier,
    recipient_user_id: Uuid,
    kind: NotificationKind,
    payload: JsonValue,
) {
    if let Err(e) = notifier.notify(recipient_user_id, kind, payload).await {
        tracing::warn!(
            recipient = %recipient_user_id,
            kind = kind.as_str(),
            error = %e,
            "notification delivery failed"
        );
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct NotificationRow {
    pub notification_id: i64,
    pub kind: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

pub async fn list_for_user(
    db: &PgPool,
    user_id: Uuid,
    after: i64,
    limit: i64,
) -> Result<Vec<NotificationRow>, sqlx::Error> {
    sqlx::query_as::<_, NotificationRow>(
        r#"
        SELECT notification_id, kind, payload, created_at
        FROM notification
        WHERE recipient_user_id = $1
          AND notification_id > $2
        ORDER BY notification_id ASC
        LIMIT $3
        "#,
    )
    .bind(user_id)
    .bind(after)
    .bind(limit)
    .fetch_all(db)
    .await
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(Uuid, NotificationKind, JsonValue)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            recipient_user_id: Uuid,
            kind: NotificationKind,
            payload: JsonValue,
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((recipient_user_id, kind, payload));
            Ok(())
        }
    }

    pub struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _: Uuid, _: NotificationKind, _: JsonValue) -> anyhow::Result<()> {
            anyhow::bail!("inbox unavailable")
        }
    }
}
