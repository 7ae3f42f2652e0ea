//! In-app notifications raised by billing flows.

use crate::error::BillingError;
use crate::models::{NewNotification, Notification};
use crate::services::clock::Clock;
use crate::services::metrics::record_notification;
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Sink for user-facing notifications.
#[async_trait]
pub trait NotificationEmitter: Send + Sync {
    /// Store a notification. A duplicate raised inside the de-duplication window
    /// resolves to the notification already stored.
    async fn create_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Notification, BillingError>;
}

/// Emit without letting a notification failure affect the caller.
pub async fn emit(notifier: &dyn NotificationEmitter, notification: NewNotification) {
    let user_id = notification.user_id;
    let title = notification.title.clone();
    if let Err(e) = notifier.create_notification(notification).await {
        tracing::warn!(
            user_id = %user_id,
            title = %title,
            error = %e,
            "Failed to emit notification"
        );
    }
}

pub struct NotificationService {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    dedup_window: Duration,
}

impl NotificationService {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>, dedup_window: Duration) -> Self {
        Self {
            store,
            clock,
            dedup_window,
        }
    }

    #[instrument(skip(self))]
    pub async fn list_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
        unread_only: bool,
    ) -> Result<Vec<Notification>, BillingError> {
        Ok(self
            .store
            .list_notifications(user_id, limit.clamp(1, 100), unread_only)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64, BillingError> {
        Ok(self.store.count_unread_notifications(user_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn mark_as_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<(), BillingError> {
        if self
            .store
            .mark_notification_read(user_id, notification_id)
            .await?
        {
            Ok(())
        } else {
            Err(BillingError::NotificationNotFound)
        }
    }

    #[instrument(skip(self))]
    pub async fn mark_all_as_read(&self, user_id: Uuid) -> Result<u64, BillingError> {
        let updated = self.store.mark_all_notifications_read(user_id).await?;
        tracing::debug!(user_id = %user_id, updated = updated, "Marked notifications read");
        Ok(updated)
    }
}

#[async_trait]
impl NotificationEmitter for NotificationService {
    #[instrument(skip(self, notification), fields(user_id = %notification.user_id, title = %notification.title))]
    async fn create_notification(
        &self,
        notification: NewNotification,
    ) -> Result<Notification, BillingError> {
        let now = self.clock.now();
        let kind = notification.notification_type.as_str();

        if let Some(existing) = self
            .store
            .find_recent_notification(&notification, now - self.dedup_window)
            .await?
        {
            tracing::debug!(
                notification_id = %existing.notification_id,
                "Duplicate notification suppressed"
            );
            record_notification(kind, "deduplicated");
            return Ok(existing);
        }

        let stored = self
            .store
            .insert_notification(&Notification {
                notification_id: Uuid::new_v4(),
                user_id: notification.user_id,
                notification_type: kind.to_string(),
                title: notification.title,
                message: notification.message,
                action_url: notification.action_url,
                action_label: notification.action_label,
                is_read: false,
                created_utc: now,
            })
            .await?;

        record_notification(kind, "created");
        tracing::info!(notification_id = %stored.notification_id, "Notification created");
        Ok(stored)
    }
}
