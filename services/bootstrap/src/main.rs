//! kindling
//!
//! Bootstraps a kind cluster with Tiller and installs a chart release into
//! it. Configuration comes from `KINDLING_*` environment variables.

use anyhow::Result;
use kindling_bootstrap::{BootstrapPlan, Collaborators, Config, Orchestrator};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cluster = %config.cluster_name,
        chart = %config.chart,
        helm_home = %config.helm_home.display(),
        readiness_policy = %config.readiness_policy,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut orchestrator = Orchestrator::new(
        BootstrapPlan::from_config(&config),
        config.resolver_config(),
        Collaborators::from_config(&config),
    );

    let run = orchestrator.run(shutdown_rx);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            run.await
        }
    };

    match result {
        Ok(outcome) => {
            info!(
                release = %outcome.release.release_name,
                namespace = %outcome.release.namespace,
                status = %outcome.release.status,
                chart = %outcome.chart.name(),
                "Release installed"
            );
            println!("{}", outcome.release.output.trim_end());
            Ok(())
        }
        Err(e) => {
            error!(stage = %e.stage(), error = %e, "kindling failed");
            Err(e.into())
        }
    }
}
