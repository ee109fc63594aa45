// Main entry point for the messaging bridge

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Layered, Route};
use reactive_messaging::{BeanRegistry, EnvConfig, ExitStatus, Mediator, Message, MessagingBuilder};
use reactive_messaging_jms::{InMemoryBroker, JmsConnector, SharedConnectionFactory};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,reactive_messaging=debug,reactive_messaging_jms=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let status = match run().await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitStatus::StartupFailure
        }
    };
    tracing::info!(code = status.code(), "messaging bridge exiting");
    status.into()
}

async fn run() -> Result<ExitStatus> {
    tracing::info!("Starting messaging bridge");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(routes = config.routes.len(), "Configuration loaded");

    let source = Layered::new(EnvConfig::new(), config.channel_defaults());

    // The in-process broker is the default connection factory
    let mut beans = BeanRegistry::new();
    let factory: SharedConnectionFactory = Arc::new(InMemoryBroker::new());
    beans.register_named::<SharedConnectionFactory>("default", factory);
    let connector = Arc::new(
        JmsConnector::with_config(Arc::new(beans), &source)
            .context("Invalid worker pool configuration")?,
    );

    let mut builder = MessagingBuilder::new()
        .config(source)
        .connector(connector.clone())
        .shutdown_deadline(config.shutdown_deadline);
    for route in &config.routes {
        tracing::info!(incoming = %route.incoming, outgoing = %route.outgoing, "Adding route");
        builder = builder.mediator(forward(route));
    }

    let runtime = builder
        .start()
        .await
        .context("Failed to start messaging runtime")?;
    tracing::info!("Messaging bridge running");

    let status = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            ExitStatus::Graceful
        }
        _ = inbound_lost(&connector, config.health_interval) => {
            tracing::error!(health = ?connector.health(), "Every inbound binding failed");
            ExitStatus::RuntimeFailure
        }
    };

    runtime.shutdown().await;
    Ok(status)
}

/// Pass-through mediator for one route.
fn forward(route: &Route) -> Mediator {
    Mediator::builder("Bridge", format!("forward_{}", route.incoming))
        .incoming(route.incoming.clone())
        .outgoing(route.outgoing.clone())
        .process_messages(|message: Message| async move { Ok(message) })
}

/// Resolves once every inbound binding has failed.
async fn inbound_lost(connector: &JmsConnector, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if connector.health().all_inbound_failed() {
            return;
        }
    }
}
