//! Waitlist notification events and the sinks that consume them.

use async_trait::async_trait;
use chrono::NaiveDate;
use classbook_core::{LessonId, ReservationId, StudentId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

/// A waitlisted party that may now be promoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistNotification {
    pub lesson_id: LessonId,
    pub date: NaiveDate,
    pub classroom: String,
    pub reservation_id: ReservationId,
    pub student_id: StudentId,
    /// From the roster; `None` when the student has no contact on file
    pub contact: Option<String>,
}

/// Delivery failure of a single notification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Notification channel closed")]
    ChannelClosed,

    #[error("Notification rejected: {reason}")]
    Rejected { reason: String },
}

/// Consumer of waitlist notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &WaitlistNotification) -> Result<(), NotifyError>;
}

/// Forwards notifications to an external delivery task over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
    tx: mpsc::Sender<WaitlistNotification>,
}

impl ChannelNotificationSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<WaitlistNotification>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotificationSink {
    async fn deliver(&self, notification: &WaitlistNotification) -> Result<(), NotifyError> {
        self.tx
            .send(notification.clone())
            .await
            .map_err(|_| NotifyError::ChannelClosed)
    }
}

/// Records notifications in the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn deliver(&self, notification: &WaitlistNotification) -> Result<(), NotifyError> {
        info!(
            lesson_id = %notification.lesson_id,
            reservation_id = %notification.reservation_id,
            student_id = %notification.student_id,
            has_contact = notification.contact.is_some(),
            "Waitlist slot available"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classbook_core::EntityIdType;

    fn notification() -> WaitlistNotification {
        WaitlistNotification {
            lesson_id: LessonId::now_v7(),
            date: NaiveDate::from_ymd_opt(2025, 5, 3).unwrap(),
            classroom: "Loom Studio".to_string(),
            reservation_id: ReservationId::now_v7(),
            student_id: StudentId::now_v7(),
            contact: Some("mika@example.test".to_string()),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelNotificationSink::channel(4);
        let sent = notification();
        sink.deliver(&sent).await.unwrap();
        assert_eq!(rx.recv().await, Some(sent));
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelNotificationSink::channel(1);
        drop(rx);
        assert_eq!(
            sink.deliver(&notification()).await,
            Err(NotifyError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_logging_sink_accepts_everything() {
        assert!(LoggingNotificationSink.deliver(&notification()).await.is_ok());
    }
}
