use axum::serve;
use branch_queue::api::routes::create_router;
use branch_queue::config::AppConfig;
use branch_queue::logic::{run_scheduler, BranchQueueOrchestrator};
use branch_queue::services::{
    AesGcmCredentials, CommunicationQueueSink, DataSelectorResolver, HttpDataSelectorResolver,
    LogNotificationSink, NoDataSelectors, NotificationSink,
};
use branch_queue::store::{BranchQueueStore, MySqlConnectionFactory, MySqlStore};
use log::{error, info};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::{Builder, Env};
    use log::LevelFilter;

    Builder::from_env(Env::default().default_filter_or("info"))
        .filter_module("sqlx", LevelFilter::Warn)
        .init();

    let config = AppConfig::load()?;

    // `branch-queue encrypt-credential` seals a secret read from stdin.
    if std::env::args().nth(1).as_deref() == Some("encrypt-credential") {
        let key = config
            .credentials
            .key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Set BRANCHQ_CREDENTIALS__KEY to encrypt credentials"))?;
        let mut secret = String::new();
        std::io::stdin().lock().read_line(&mut secret)?;
        println!("{}", AesGcmCredentials::from_hex_key(key)?.encrypt(secret.trim_end())?);
        return Ok(());
    }
    info!(
        "Configuration loaded: server={}:{}",
        config.server.host, config.server.port
    );

    let database_url = config.database_url()?;
    let queue_settings = config.branch_queue_settings()?;
    let mysql_store = MySqlStore::new(
        &database_url,
        config.database.max_connections.unwrap_or(5),
    )
    .await?;
    mysql_store.migrate().await?;
    info!("Branch queue tables ready in '{}'", queue_settings.production.database_name);

    let notifier: Arc<dyn NotificationSink> = if config.notifications.enabled {
        Arc::new(CommunicationQueueSink::new(
            mysql_store.pool().clone(),
            config.notifications.sender.clone(),
        ))
    } else {
        Arc::new(LogNotificationSink)
    };
    let data_selectors: Arc<dyn DataSelectorResolver> = match &config.data_selectors.base_url {
        Some(base_url) => Arc::new(HttpDataSelectorResolver::new(
            base_url.clone(),
            config.data_selectors.access_token.clone(),
        )),
        None => Arc::new(NoDataSelectors),
    };
    let store: Arc<dyn BranchQueueStore> = Arc::new(mysql_store);

    let cancel = CancellationToken::new();
    let scheduler = if config.queue.enabled {
        let mut orchestrator = BranchQueueOrchestrator::new(
            store.clone(),
            Arc::new(MySqlConnectionFactory::new()),
            notifier,
            data_selectors,
        )
        .with_templates(config.notifications.templates.clone());
        if let Some(key) = &config.credentials.key {
            orchestrator = orchestrator.with_decryptor(Arc::new(AesGcmCredentials::from_hex_key(key)?));
            info!("Encrypted credentials enabled");
        }
        Some(tokio::spawn(run_scheduler(
            Arc::new(orchestrator),
            queue_settings,
            Duration::from_secs(config.queue.poll_interval_secs.max(1)),
            cancel.clone(),
        )))
    } else {
        info!("Branch queue polling is disabled");
        None
    };

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    info!("Admin API listening on http://{}", bind_address);

    let shutdown = cancel.clone();
    let server = serve(listener, create_router().with_state(store))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Could not listen for ctrl-c: {}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        });
    server.await?;

    cancel.cancel();
    if let Some(scheduler) = scheduler {
        if let Err(e) = scheduler.await {
            error!("Scheduler task failed: {}", e);
        }
    }
    Ok(())
}
