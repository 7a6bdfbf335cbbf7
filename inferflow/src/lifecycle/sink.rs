//! Notification sinks.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

use super::{Notification, NotificationKind};
use crate::core::JobId;

/// Receives lifecycle notifications.
///
/// Sinks must not fail the pipeline: errors inside a sink are logged and
/// suppressed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits a notification.
    async fn emit(&self, notification: Notification);

    /// Emits a notification without awaiting.
    fn try_emit(&self, notification: Notification);
}

/// A sink that discards everything. The default when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _notification: Notification) {}

    fn try_emit(&self, _notification: Notification) {}
}

/// A sink that writes notifications to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log(&self, n: &Notification) {
        if self.level == Level::DEBUG || self.level == Level::TRACE {
            debug!(
                notification = %n.kind,
                job_id = %n.job_id,
                stage = ?n.stage,
                detail = ?n.detail,
                "Job {}", n.kind
            );
        } else {
            info!(
                notification = %n.kind,
                job_id = %n.job_id,
                stage = ?n.stage,
                detail = ?n.detail,
                "Job {}", n.kind
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, notification: Notification) {
        self.log(&notification);
    }

    fn try_emit(&self, notification: Notification) {
        self.log(&notification);
    }
}

/// A sink that keeps every notification, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    notifications: RwLock<Vec<Notification>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().clone()
    }

    /// Notifications of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.notifications
            .read()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }

    /// Notifications for one job, in emission order.
    #[must_use]
    pub fn for_job(&self, job_id: JobId) -> Vec<Notification> {
        self.notifications
            .read()
            .iter()
            .filter(|n| n.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Number of notifications of one kind.
    #[must_use]
    pub fn count(&self, kind: NotificationKind) -> usize {
        self.notifications.read().iter().filter(|n| n.kind == kind).count()
    }

    /// Number of notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.notifications.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifications.read().is_empty()
    }

    /// Drops everything collected.
    pub fn clear(&self) {
        self.notifications.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, notification: Notification) {
        self.notifications.write().push(notification);
    }

    fn try_emit(&self, notification: Notification) {
        self.notifications.write().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stage;

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit(Notification::new(NotificationKind::JobCreated, JobId::new())).await;
        sink.try_emit(Notification::new(NotificationKind::JobFailed, JobId::new()));
    }

    #[tokio::test]
    async fn test_logging_sink() {
        let sink = LoggingEventSink::default();
        sink.emit(Notification::new(NotificationKind::StageStarted, JobId::new()).with_stage(Stage::Retrieve))
            .await;
        LoggingEventSink::debug().try_emit(Notification::new(NotificationKind::JobCompleted, JobId::new()));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        let job_a = JobId::new();
        let job_b = JobId::new();
        sink.emit(Notification::new(NotificationKind::JobCreated, job_a)).await;
        sink.emit(Notification::new(NotificationKind::JobCreated, job_b)).await;
        sink.try_emit(Notification::new(NotificationKind::JobCompleted, job_a));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.count(NotificationKind::JobCreated), 2);
        assert_eq!(sink.of_kind(NotificationKind::JobCompleted)[0].job_id, job_a);

        let kinds: Vec<NotificationKind> = sink.for_job(job_a).iter().map(|n| n.kind).collect();
        assert_eq!(kinds, vec![NotificationKind::JobCreated, NotificationKind::JobCompleted]);

        sink.clear();
        assert!(sink.is_empty());
    }
}
