use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::{Parser, Subcommand};

use txn_categorizer::config::CategorizerConfig;
use txn_categorizer::health::{HealthState, health_routes, spawn_health_server};
use txn_categorizer::pipeline::categorizer::Categorizer;
use txn_categorizer::pipeline::consumer::{Consumer, ConsumerConfig, verify_category_keys};
use txn_categorizer::pipeline::merchants::{Merchant, MerchantMatcher};
use txn_categorizer::pipeline::reconcile::reconcile_merchants;
use txn_categorizer::source::JsonLinesSource;
use txn_categorizer::store::{Database, LibSqlBackend};

#[derive(Parser, Debug)]
#[command(name = "txn-categorizer", version, about = "Bank transaction categorizer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume transaction events and categorize them (default)
    Consume,

    /// Link stored transactions that have no merchant yet
    Reconcile {
        /// Rows fetched per page (default: MERCHANT_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = CategorizerConfig::from_env().context("invalid configuration")?;

    let backend = LibSqlBackend::open(&config.database)
        .await
        .context("failed to open database")?;
    let db: Arc<dyn Database> = Arc::new(backend);

    let matcher = load_merchants(db.as_ref()).await?;

    match cli.command.unwrap_or(Command::Consume) {
        Command::Consume => consume(config, db, matcher).await,
        Command::Reconcile { batch_size } => {
            let batch_size = batch_size.unwrap_or(config.merchant_batch_size);
            let report = reconcile_merchants(db.as_ref(), &matcher, batch_size)
                .await
                .context("merchant reconciliation failed")?;
            eprintln!(
                "Reviewed {} unlinked transactions, linked {}",
                report.reviewed, report.linked
            );
            Ok(())
        }
    }
}

async fn load_merchants(db: &dyn Database) -> anyhow::Result<MerchantMatcher> {
    let records = db
        .fetch_merchants()
        .await
        .context("failed to load merchants")?;
    let merchants = records
        .iter()
        .map(|r| Merchant::new(r.id, &r.key, &r.name, r.aliases.as_slice()))
        .collect();
    let matcher = MerchantMatcher::new(merchants);
    tracing::info!(merchants = matcher.len(), "Merchant catalog loaded");
    Ok(matcher)
}

async fn consume(
    config: CategorizerConfig,
    db: Arc<dyn Database>,
    matcher: MerchantMatcher,
) -> anyhow::Result<()> {
    let categorizer = Categorizer::default()
        .with_rule_confidence(config.rule_confidence)
        .with_fallback_threshold(config.fallback_threshold);

    let missing = verify_category_keys(db.as_ref(), &categorizer)
        .await
        .context("category check failed")?;
    if !missing.is_empty() {
        tracing::warn!(
            missing = missing.len(),
            "Events categorized under missing keys will be skipped"
        );
    }

    let health = spawn_health_server(
        &config.health_addr(),
        health_routes(
            HealthState::for_database(Arc::clone(&db)),
            config.health_log_requests,
        ),
    )
    .await
    .with_context(|| format!("failed to bind health server on {}", config.health_addr()))?;

    let source = JsonLinesSource::open(&config.source_path)
        .await
        .with_context(|| format!("failed to open {}", config.source_path.display()))?;

    eprintln!("Transaction categorizer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Source: {}", config.source_path.display());
    eprintln!("   Health: http://{}/health", health.local_addr());

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown requested; finishing current event");
        flag.store(true, Ordering::Relaxed);
    });

    let mut consumer = Consumer::new(
        source,
        db,
        categorizer,
        matcher,
        ConsumerConfig {
            poll_timeout: config.poll_timeout,
            retry_backoff: config.retry_backoff,
            retry_backoff_max: config.retry_backoff_max,
        },
    );
    consumer.run(shutdown).await;

    health.stop().await;
    tracing::info!("Categorizer stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable; waiting for Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
