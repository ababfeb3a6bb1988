use std::sync::Arc;

use newsletter_digest::config::{PipelineConfig, StoreConfig};
use newsletter_digest::scheduler;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = PipelineConfig::from_env()?;

    // Initialize tracing: stderr always, plus a daily file when LOG_DIR is set
    let file_layer = config.log_dir.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "newsletter-digest.log");
        tracing_subscriber::fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
    });
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    eprintln!("📰 Newsletter Digest v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Primary: {} ({})",
        config.primary.backend.as_str(),
        config.primary.model
    );
    match &config.secondary {
        Some(secondary) => eprintln!(
            "   Secondary: {} ({})",
            secondary.backend.as_str(),
            secondary.model
        ),
        None => eprintln!("   Secondary: none"),
    }

    match &config.store {
        StoreConfig::Notion { database_id, .. } => {
            eprintln!("   Store: notion (database {})", database_id)
        }
        StoreConfig::LibSql { path } => eprintln!("   Store: libsql ({})", path.display()),
    }
    if let Some(email) = &config.email {
        eprintln!(
            "   Mailbox: {} on {} ({})",
            email.username, email.imap_host, email.folder
        );
    }
    if let Some(dir) = &config.prompt_dir {
        eprintln!("   Prompts: {}", dir.display());
    }

    let runner = Arc::new(scheduler::build_runner(&config).await?);

    match &config.schedule {
        Some(expr) => {
            let schedule = scheduler::parse_schedule(expr)?;
            eprintln!("   Schedule: {}\n", expr);
            let handle = scheduler::spawn_scheduler(runner, schedule);
            tokio::select! {
                result = handle => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, shutting down");
                }
            }
        }
        None => {
            eprintln!("   Schedule: single run\n");
            let summary = runner.run_once().await;
            eprintln!(
                "Fetched {}, persisted {}, rejected {}, failed {}",
                summary.report.fetched,
                summary.report.persisted,
                summary.report.rejected,
                summary.report.failed
            );
            if summary.report.fetch_failed {
                return Err("mailbox fetch failed".into());
            }
            if !summary.digest.is_empty() {
                println!("{}", summary.digest.markdown);
            }
        }
    }

    Ok(())
}
