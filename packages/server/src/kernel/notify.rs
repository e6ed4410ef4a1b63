//! Best-effort job wakeup notifications.
//!
//! Each job type has one named subject (`jobs.<type>`). Publishing is
//! fire-and-forget: a lost notification only delays pickup until the next
//! worker poll, never loses work. Waiting is bounded by a timeout for the
//! same reason - workers MUST poll on a timer regardless; notifications are
//! a latency optimization, not a correctness dependency.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// Subject for a job type's wakeup channel.
pub fn job_subject(job_type: &str) -> String {
    format!("jobs.{}", job_type)
}

/// Trait for publishing and awaiting job wakeups.
///
/// This allows swapping between real NATS and test mocks.
#[async_trait]
pub trait BaseJobNotifier: Send + Sync {
    /// Publish a wakeup for the given job type. Payload may be empty.
    async fn notify(&self, job_type: &str) -> Result<()>;

    /// Block until a wakeup for the given job type or until the timeout.
    ///
    /// Returns `true` when a signal arrived. The default implementation just
    /// sleeps out the timeout, which degrades a waiter to pure polling.
    async fn wait(&self, job_type: &str, timeout: Duration) -> Result<bool> {
        let _ = job_type;
        tokio::time::sleep(timeout).await;
        Ok(false)
    }
}

// =============================================================================
// NATS-backed notifier
// =============================================================================

/// Real NATS publisher/subscriber.
pub struct NatsJobNotifier {
    client: async_nats::Client,
}

impl NatsJobNotifier {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BaseJobNotifier for NatsJobNotifier {
    async fn notify(&self, job_type: &str) -> Result<()> {
        self.client
            .publish(job_subject(job_type), Bytes::new())
            .await?;
        Ok(())
    }

    async fn wait(&self, job_type: &str, timeout: Duration) -> Result<bool> {
        let mut subscriber = self.client.subscribe(job_subject(job_type)).await?;
        let received = tokio::time::timeout(timeout, subscriber.next())
            .await
            .is_ok();
        let _ = subscriber.unsubscribe().await;
        Ok(received)
    }
}

// =============================================================================
// No-op and test notifiers
// =============================================================================

/// Notifier for deployments without a message bus. Workers rely on polling.
#[derive(Default)]
pub struct NullJobNotifier;

#[async_trait]
impl BaseJobNotifier for NullJobNotifier {
    async fn notify(&self, _job_type: &str) -> Result<()> {
        Ok(())
    }
}

/// Mock notifier that records published subjects and delivers in-process
/// wakeups for test assertions.
#[derive(Default)]
pub struct TestJobNotifier {
    published: RwLock<Vec<String>>,
    waiters: Mutex<HashMap<String, std::sync::Arc<Notify>>>,
}

impl TestJobNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subjects published so far.
    pub fn published(&self) -> Vec<String> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn waiter(&self, subject: &str) -> std::sync::Arc<Notify> {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(subject.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl BaseJobNotifier for TestJobNotifier {
    async fn notify(&self, job_type: &str) -> Result<()> {
        let subject = job_subject(job_type);
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(subject.clone());
        self.waiter(&subject).notify_waiters();
        Ok(())
    }

    async fn wait(&self, job_type: &str, timeout: Duration) -> Result<bool> {
        let notify = self.waiter(&job_subject(job_type));
        Ok(tokio::time::timeout(timeout, notify.notified())
            .await
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_is_keyed_by_job_type() {
        assert_eq!(job_subject("browser"), "jobs.browser");
        assert_eq!(job_subject("rules"), "jobs.rules");
    }

    #[tokio::test]
    async fn test_notifier_records_publishes() {
        let notifier = TestJobNotifier::new();
        notifier.notify("rules").await.unwrap();
        notifier.notify("alert").await.unwrap();
        assert_eq!(notifier.published(), vec!["jobs.rules", "jobs.alert"]);
    }

    #[tokio::test]
    async fn wait_times_out_without_a_signal() {
        let notifier = TestJobNotifier::new();
        let signalled = notifier
            .wait("rules", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!signalled);
    }

    #[tokio::test]
    async fn wait_wakes_on_notify() {
        let notifier = std::sync::Arc::new(TestJobNotifier::new());

        let waiter = {
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.wait("rules", Duration::from_secs(5)).await })
        };
        // Let the waiter register before signalling.
        tokio::time::sleep(Duration::from_millis(20)).await;
        notifier.notify("rules").await.unwrap();

        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn null_notifier_is_silent() {
        let notifier = NullJobNotifier;
        assert!(notifier.notify("browser").await.is_ok());
    }
}
