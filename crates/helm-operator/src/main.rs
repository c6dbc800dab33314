//! helm-controller: runs the HelmChart watcher and HelmRelease reconciler

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use helm_common::default_registry;
use helm_common::telemetry::{init_telemetry, TelemetryConfig};
use helm_operator::controller::ChartStatusApplier;
use helm_operator::{
    HelmChartWatcher, HelmReleaseReconciler, HelmReleaseReconcilerOptions, ProcessOptions,
    RuntimeHost, SetupWithHost,
};

#[tokio::main]
async fn main() -> ExitCode {
    let options = match ProcessOptions::parse(std::env::args_os()) {
        Ok(options) => options,
        Err(e) => e.exit(),
    };

    let telemetry = match init_telemetry(TelemetryConfig {
        log_json: options.log_json,
        ..Default::default()
    }) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("unable to initialize telemetry: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(options, telemetry.registry).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(target: "setup", error = ?e, "{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(options: ProcessOptions, metrics: prometheus::Registry) -> anyhow::Result<()> {
    let registry = default_registry().context("unable to build type registry")?;

    let mut host = RuntimeHost::connect(options.clone(), registry, metrics)
        .await
        .context("unable to start manager")?;

    HelmChartWatcher::new()
        .attach_to(&mut host)
        .context("unable to create controller HelmChart")?;

    HelmReleaseReconciler::new(
        Arc::new(ChartStatusApplier::new()),
        HelmReleaseReconcilerOptions {
            max_concurrent_reconciles: options.concurrent,
            dependency_requeue_interval: options.requeue_dependency,
        },
    )
    .attach_to(&mut host)
    .context("unable to create controller HelmRelease")?;

    let shutdown =
        helm_operator::signals::shutdown_token().context("unable to install signal handlers")?;

    tracing::info!(
        target: "setup",
        metrics_addr = %options.metrics_addr,
        leader_election = options.enable_leader_election,
        concurrent = options.concurrent,
        "starting manager"
    );
    host.run(shutdown).await.context("problem running manager")
}
