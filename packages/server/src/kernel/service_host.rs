//! Long-running service abstraction with graceful shutdown.
//!
//! Every background loop (scheduler, workers, reaper) implements `Service`
//! and runs under a `ServiceHost`, which fans a single `CancellationToken`
//! out to all of them and waits for each to drain.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A long-running background service.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run until the shutdown token is cancelled.
    ///
    /// Implementations should check the token between units of work and exit
    /// cleanly when it fires; returning an error is reserved for unrecoverable
    /// failures.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Hosts a set of services and coordinates their shutdown.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a service to run.
    pub fn with_service(mut self, service: Box<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Token that fires when shutdown begins. Useful for wiring auxiliary
    /// tasks to the same lifecycle.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all services until Ctrl+C, then shut them down gracefully.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.cancel();
        });

        self.run().await
    }

    /// Run all services until the host's token is cancelled.
    pub async fn run(self) -> Result<()> {
        let mut handles: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

        for service in self.services {
            let name = service.name();
            let token = self.shutdown.clone();
            info!(service = name, "starting service");
            handles.push((name, tokio::spawn(service.run(token))));
        }

        for (name, handle) in handles {
            match drain(handle).await {
                Ok(Ok(())) => info!(service = name, "service stopped"),
                Ok(Err(e)) => error!(service = name, error = %e, "service failed"),
                Err(_) => warn!(service = name, "service did not stop in time"),
            }
        }

        Ok(())
    }
}

/// Wait for a service task with a drain timeout so one stuck service cannot
/// wedge shutdown forever.
async fn drain(handle: JoinHandle<Result<()>>) -> Result<Result<()>, tokio::time::error::Elapsed> {
    tokio::time::timeout(Duration::from_secs(30), async {
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("service task panicked: {}", e)),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlagService {
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Service for FlagService {
        fn name(&self) -> &'static str {
            "flag"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn host_runs_services_and_stops_on_cancel() {
        let ran = Arc::new(AtomicBool::new(false));
        let host = ServiceHost::new().with_service(Box::new(FlagService { ran: ran.clone() }));

        let token = host.shutdown_token();
        let run = tokio::spawn(host.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ran.load(Ordering::SeqCst));

        token.cancel();
        run.await.unwrap().unwrap();
    }
}
