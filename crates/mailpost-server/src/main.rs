//! mailpost - SMTP to webhook gateway entry point

use anyhow::Result;
use clap::Parser;
use mailpost_common::config::{Config, LoggingConfig};
use mailpost_core::{
    AuthSettings, Orchestrator, ScriptValidator, SmtpServer, WebhookDispatcher, WhatlangDetector,
};
use mailpost_storage::StagingStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Receive mail over SMTP and post each message to a webhook as JSON
#[derive(Parser, Debug)]
#[command(name = "mailpost", version, about)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SMTP listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Staging directory for in-flight messages
    #[arg(long)]
    tmp: Option<PathBuf>,

    /// Webhook URL
    #[arg(long)]
    webhook: Option<String>,

    /// Mark every message as failing DKIM without running the validator
    #[arg(long)]
    disable_dkim: bool,

    /// Mark every message as failing SPF without running the validator
    #[arg(long)]
    disable_spf: bool,

    /// Log envelopes instead of posting them
    #[arg(long)]
    disable_webhook: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.smtp.port = port;
        }
        if let Some(tmp) = &self.tmp {
            config.staging.tmp = tmp.clone();
        }
        if let Some(url) = &self.webhook {
            config.webhook.url = url.clone();
        }
        if self.disable_dkim {
            config.auth.disable_dkim = true;
        }
        if self.disable_spf {
            config.auth.disable_spf = true;
        }
        if self.disable_webhook {
            config.webhook.enabled = false;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    cli.apply(&mut config);
    config.validate()?;

    init_logging(&config.logging);

    info!("Starting mailpost...");

    // Decided once; every session uses the same answer
    let auth = AuthSettings::detect(&config.auth);
    if auth.runtime_available {
        info!(
            runtime = %config.auth.runtime,
            dkim = auth.dkim_active(),
            spf = auth.spf_active(),
            "Validator runtime found"
        );
    } else {
        warn!(
            runtime = %config.auth.runtime,
            "Validator runtime not found; DKIM and SPF will be reported as failed"
        );
    }

    let store = StagingStore::new(&config.staging)?;
    info!("Staging messages in {}", store.base_path().display());
    // Transfers cut off by a previous shutdown left their files behind
    store.sweep().await?;

    let dispatcher = WebhookDispatcher::new(&config.webhook)?;
    if config.webhook.enabled {
        info!("Posting envelopes to {}", dispatcher.url());
    } else {
        info!("Webhook disabled; envelopes will only be logged");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::new(ScriptValidator::new(&config.auth)),
        auth,
        Arc::new(WhatlangDetector::new()),
        dispatcher,
    ));

    let smtp_server = Arc::new(SmtpServer::new(
        config.smtp.clone(),
        Arc::clone(&orchestrator),
    ));

    let listener = match smtp_server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let smtp_handle = tokio::spawn(async move {
        if let Err(e) = smtp_server.serve(listener).await {
            error!("SMTP server error: {}", e);
        }
    });

    info!("mailpost started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    smtp_handle.abort();

    let in_flight = orchestrator.in_flight();
    if in_flight > 0 {
        info!("Waiting for {} message pipelines to finish", in_flight);
    }
    orchestrator.shutdown().await;

    info!("mailpost shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
