//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across the whole test run; each test
//! gets its own database inside it (created and migrated on setup) so
//! parallel tests cannot observe each other's queues.

use anyhow::{Context, Result};
use server_core::kernel::jobs::PostgresJobRepo;
use server_core::kernel::scheduler::ScheduledTaskStore;
use server_core::kernel::{InMemorySharedCache, TestJobNotifier};
use sqlx::PgPool;
use std::sync::Arc;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

// =============================================================================
// Shared Test Infrastructure
// =============================================================================

struct SharedTestInfra {
    admin_url: String,
    host: String,
    port: u16,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG when debugging tests; try_init avoids panicking
        // when several tests race initialization.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?.to_string();
        let port = postgres.get_host_port_ipv4(5432).await?;
        let admin_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        Ok(Self {
            admin_url,
            host,
            port,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }

    /// Create and migrate a fresh database for one test.
    async fn fresh_database(&self) -> Result<PgPool> {
        let db_name = format!("test_{}", uuid::Uuid::new_v4().simple());

        let admin = PgPool::connect(&self.admin_url)
            .await
            .context("Failed to connect to admin database")?;
        sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let url = format!(
            "postgresql://postgres:postgres@{}:{}/{db_name}",
            self.host, self.port
        );
        let pool = PgPool::connect(&url)
            .await
            .context("Failed to connect to test database")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        Ok(pool)
    }
}

// =============================================================================
// TestHarness
// =============================================================================

/// Per-test database handle plus in-process fakes.
pub struct TestHarness {
    pub db_pool: PgPool,
    pub shared_cache: Arc<InMemorySharedCache>,
    pub notifier: Arc<TestJobNotifier>,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let db_pool = infra.fresh_database().await?;

        Ok(Self {
            db_pool,
            shared_cache: Arc::new(InMemorySharedCache::new()),
            notifier: Arc::new(TestJobNotifier::new()),
        })
    }

    /// Job repo wired to the recording notifier.
    pub fn job_repo(&self) -> Arc<PostgresJobRepo> {
        Arc::new(PostgresJobRepo::new(
            self.db_pool.clone(),
            self.notifier.clone(),
        ))
    }

    pub fn task_store(&self) -> ScheduledTaskStore {
        ScheduledTaskStore::new(self.db_pool.clone())
    }
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}
