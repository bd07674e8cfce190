//! heimdall-webhook - ownership admission webhook.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Parses and validates configuration
//! - Creates the Kubernetes client used for broker discovery
//! - Starts the health server and the TLS webhook server

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{debug, error, info};

use heimdall_webhook::health::{HealthState, run_health_server};
use heimdall_webhook::reconcile::{KafkaReconcileQueue, MeteredQueue, ServiceBrokerDirectory};
use heimdall_webhook::webhooks::{OwnershipEngine, WebhookState, run_webhook_server};
use heimdall_webhook::WebhookConfig;

/// Grace period for in-flight admission requests to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("heimdall_webhook=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    // Must run before any TLS config is built
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed, keeping it");
    }

    let config = WebhookConfig::parse();
    config.validate()?;
    info!(
        port = config.webhook_port,
        path = %config.admission_path,
        topic = %config.topic,
        broker_namespace = %config.broker_namespace,
        broker_cluster = %config.broker_cluster,
        "Starting heimdall-webhook"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    let broker_config = config.broker_config();
    let directory = ServiceBrokerDirectory::new(client, broker_config.clone());
    let queue = MeteredQueue::new(
        KafkaReconcileQueue::new(directory, broker_config),
        health_state.clone(),
    );
    let engine = OwnershipEngine::new(config.ownership_policy(), Arc::new(queue));
    let webhook_state = Arc::new(WebhookState::new(
        engine,
        health_state.clone(),
        config.max_body_bytes,
    ));

    // Start health server immediately so liveness works while TLS loads
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let webhook_handle = {
        let config = config.clone();
        tokio::spawn(async move { run_webhook_server(&config, webhook_state).await })
    };

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = webhook_handle => {
            match result {
                Ok(Ok(())) => info!("Webhook server exited"),
                Ok(Err(e)) => {
                    error!("Webhook server error: {}", e);
                    return Err(e.into());
                }
                Err(e) => error!("Webhook server task panicked: {}", e),
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready so the control plane stops routing reviews here
            health_state.set_ready(false).await;
            info!("Marked webhook as not ready");

            info!(
                "Waiting {}s for in-flight admission requests to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Webhook stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the webhook cannot shut down
/// gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
