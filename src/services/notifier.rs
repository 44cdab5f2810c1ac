//! Deferred delivery of messages, used to schedule post-expiry cleanup.

use crate::errors::{ServiceError, ServiceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const JSON_CONTENT_TYPE: &str = "application/json";

/// A serialized payload plus its content type.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedMessage {
    pub content_type: String,
    pub body: String,
}

impl QueuedMessage {
    pub fn json<T: Serialize>(payload: &T) -> ServiceResult<Self> {
        Ok(Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            body: serde_json::to_string(payload)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> ServiceResult<T> {
        if self.content_type != JSON_CONTENT_TYPE {
            return Err(ServiceError::Unexpected(format!(
                "unsupported message content type `{}`",
                self.content_type
            )));
        }
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[async_trait]
pub trait DeferredNotifier: Send + Sync {
    /// Deliver `message` no earlier than `deliver_at`, which must be in the future.
    async fn schedule(
        &self,
        message: QueuedMessage,
        deliver_at: DateTime<Utc>,
    ) -> ServiceResult<()>;

    /// Deliver `message` as soon as possible.
    async fn send(&self, message: QueuedMessage) -> ServiceResult<()>;
}

/// Reject delivery times that are not strictly after `now`.
pub fn ensure_future(deliver_at: DateTime<Utc>, now: DateTime<Utc>) -> ServiceResult<()> {
    if deliver_at <= now {
        return Err(ServiceError::invalid(
            "scheduleAt",
            "must be in the future.",
        ));
    }
    Ok(())
}

/// A message whose delivery time has arrived.
#[derive(Clone, Debug, FromRow)]
pub struct DueMessage {
    pub id: String,
    pub content_type: String,
    pub body: String,
    pub deliver_at: DateTime<Utc>,
}

impl DueMessage {
    pub fn message(&self) -> QueuedMessage {
        QueuedMessage {
            content_type: self.content_type.clone(),
            body: self.body.clone(),
        }
    }
}

/// Queue backed by the `scheduled_messages` table.
#[derive(Clone)]
pub struct SqliteNotifier {
    pub db: Arc<SqlitePool>,
}

impl SqliteNotifier {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn enqueue(&self, message: &QueuedMessage, deliver_at: DateTime<Utc>) -> ServiceResult<()> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO scheduled_messages (id, content_type, body, deliver_at, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&message.content_type)
        .bind(&message.body)
        .bind(deliver_at)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        debug!("queued message {} for {}", id, deliver_at);
        Ok(())
    }

    /// Mark up to `limit` due messages as delivered and return them.
    ///
    /// Claiming is a single statement, so concurrent workers never receive
    /// the same message.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> ServiceResult<Vec<DueMessage>> {
        let due = sqlx::query_as::<_, DueMessage>(
            r#"
            UPDATE scheduled_messages SET delivered_at = ?
            WHERE id IN (
                SELECT id FROM scheduled_messages
                WHERE delivered_at IS NULL AND julianday(deliver_at) <= julianday(?)
                ORDER BY deliver_at ASC
                LIMIT ?
            )
            RETURNING id, content_type, body, deliver_at
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(due)
    }

    /// Messages not yet delivered.
    pub async fn pending(&self) -> ServiceResult<Vec<DueMessage>> {
        let rows = sqlx::query_as::<_, DueMessage>(
            "SELECT id, content_type, body, deliver_at FROM scheduled_messages
             WHERE delivered_at IS NULL ORDER BY deliver_at ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl DeferredNotifier for SqliteNotifier {
    async fn schedule(
        &self,
        message: QueuedMessage,
        deliver_at: DateTime<Utc>,
    ) -> ServiceResult<()> {
        ensure_future(deliver_at, Utc::now())?;
        self.enqueue(&message, deliver_at).await
    }

    async fn send(&self, message: QueuedMessage) -> ServiceResult<()> {
        self.enqueue(&message, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::memory_pool, models::delete_message::DeleteFileMessage};
    use chrono::Duration;

    fn payload(expires_at: DateTime<Utc>) -> DeleteFileMessage {
        DeleteFileMessage {
            file_id: "abc".into(),
            file_name: "abc/r.pdf".into(),
            container_name: "snappshare".into(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn rejects_past_delivery_times() {
        let notifier = SqliteNotifier::new(memory_pool().await);
        let message = QueuedMessage::json(&payload(Utc::now())).unwrap();
        let err = notifier
            .schedule(message, Utc::now() - Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument { .. }));
        assert!(notifier.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduled_messages_are_claimed_once_due() {
        let notifier = SqliteNotifier::new(memory_pool().await);
        let deliver_at = Utc::now() + Duration::minutes(10);
        let message = QueuedMessage::json(&payload(deliver_at)).unwrap();
        notifier.schedule(message, deliver_at).await.unwrap();

        assert!(notifier.claim_due(Utc::now(), 10).await.unwrap().is_empty());

        let later = deliver_at + Duration::seconds(1);
        let due = notifier.claim_due(later, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        let decoded: DeleteFileMessage = due[0].message().decode().unwrap();
        assert_eq!(decoded, payload(deliver_at));

        assert!(notifier.claim_due(later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_is_immediately_due() {
        let notifier = SqliteNotifier::new(memory_pool().await);
        notifier
            .send(QueuedMessage::json(&payload(Utc::now())).unwrap())
            .await
            .unwrap();
        let due = notifier
            .claim_due(Utc::now() + Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].content_type, "application/json");
    }
}
