// Main entry point for the control-plane services

use anyhow::{Context, Result};
use server_core::domains::alert::{AlertDispatcher, AlertService};
use server_core::domains::rules::{
    AlertOnceCache, RulesJobHandler, RulesOrchestrator, RulesPipeline, SeenDomainsCache,
};
use server_core::domains::secret::{SecretRefreshHandler, SecretRefreshScheduler};
use server_core::domains::source::SourceCache;
use server_core::kernel::jobs::{JobRegistry, JobType, JobWorker, PostgresJobRepo, Reaper};
use server_core::kernel::scheduler::{ScheduledTaskStore, Scheduler, SchedulerOptions};
use server_core::kernel::{
    BaseJobNotifier, InMemorySharedCache, NatsJobNotifier, NullJobNotifier, ReqwestHttpSender,
    ServerDeps, ServiceHost,
};
use server_core::Config;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Sitewatch control plane");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Connect to database
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Best-effort job wakeups; workers poll regardless.
    let notifier: Arc<dyn BaseJobNotifier> = match &config.nats_url {
        Some(url) => {
            let client = async_nats::connect(url)
                .await
                .context("Failed to connect to NATS")?;
            tracing::info!("NATS connected");
            Arc::new(NatsJobNotifier::new(client))
        }
        None => Arc::new(NullJobNotifier),
    };

    let shared_cache = Arc::new(InMemorySharedCache::new());
    let deps = Arc::new(ServerDeps::new(
        pool.clone(),
        shared_cache.clone(),
        notifier.clone(),
        Arc::new(ReqwestHttpSender::default()),
        config.base_url.clone(),
    ));

    let repo = Arc::new(PostgresJobRepo::new(pool.clone(), notifier.clone()));
    let task_store = ScheduledTaskStore::new(pool.clone());
    let source_cache = Arc::new(SourceCache::new(pool.clone(), shared_cache.clone()));

    // Alert path: service -> dispatcher -> delivery jobs.
    let dispatcher = Arc::new(
        AlertDispatcher::new(pool.clone(), config.base_url.clone())
            .with_sink_scheduler(repo.clone()),
    );
    let alerts = Arc::new(AlertService::new(pool.clone()).with_dispatcher(dispatcher));

    // Rules path.
    let pipeline = Arc::new(
        RulesPipeline::new(
            pool.clone(),
            SeenDomainsCache::new(pool.clone(), shared_cache.clone()),
            AlertOnceCache::new(shared_cache.clone()),
            alerts.clone(),
        )
        .load_rule_config(&pool)
        .await
        .context("Failed to load rule configuration")?,
    );
    let orchestrator = Arc::new(RulesOrchestrator::new(
        pool.clone(),
        repo.clone(),
        pipeline,
        shared_cache.clone(),
    ));

    // Secret refresh path.
    let refresh = Arc::new(SecretRefreshScheduler::new(
        pool.clone(),
        task_store.clone(),
        repo.clone(),
    ));

    let registry = Arc::new(
        JobRegistry::new()
            .register(JobType::Rules, Arc::new(RulesJobHandler::new(orchestrator)))
            .register(
                JobType::SecretRefresh,
                Arc::new(SecretRefreshHandler::new(refresh)),
            ),
    );

    let scheduler = Scheduler::new(
        task_store,
        repo.clone(),
        notifier,
        SchedulerOptions {
            tick_interval: config.scheduler.tick_interval,
            batch_size: config.scheduler.batch_size,
            ..Default::default()
        },
    )
    .with_script_resolver(source_cache);

    let worker = JobWorker::new(repo, registry, deps);
    let reaper = Reaper::new(pool, config.reaper.clone());

    ServiceHost::new()
        .with_service(Box::new(scheduler))
        .with_service(Box::new(worker))
        .with_service(Box::new(reaper))
        .run_until_shutdown()
        .await
}
