use std::sync::Arc;

use envconfig::Envconfig;
use kube::Client;
use oprc_gitops::apis::{ApiDetector, KubeDiscovery};
use oprc_gitops::config::OperatorConfig;
use oprc_gitops::controller::events::KubeEventSink;
use oprc_gitops::controller::registry::InstanceRegistry;
use oprc_gitops::controller::{ControllerContext, Engine, run_controller};
use oprc_gitops::desired::PlatformBuilder;
use oprc_gitops::init_tracing;
use oprc_gitops::store::KubeStore;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    // Ensure rustls uses the aws-lc-rs provider explicitly.
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        tracing::debug!(
            ?e,
            "CryptoProvider already installed or incompatible; proceeding"
        );
    }

    let cfg = OperatorConfig::init_from_env()?.apply_profile_defaults();
    info!(?cfg, "Starting GitOps operator");

    let client = Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client.clone(), cfg.store_timeout()));
    let apis = Arc::new(ApiDetector::new(KubeDiscovery::new(client.clone())));
    let engine = Arc::new(
        Engine::new(
            store,
            Arc::new(PlatformBuilder::new(cfg.builder_defaults())),
            Arc::new(KubeEventSink::new(client.clone(), "oprc-gitops")),
            Arc::new(InstanceRegistry::new()),
            cfg.engine_settings(),
        )
        .with_api_detector(apis.clone()),
    );
    info!(route = apis.has_route().await, "api discovery done");

    let refresh = cfg.api_refresh();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(refresh);
        tick.tick().await;
        loop {
            tick.tick().await;
            apis.invalidate();
        }
    });

    let claims = engine.claims().rebuild_index().await?;
    info!(claims, "claim index loaded");

    let ctx = Arc::new(ControllerContext { engine, cfg });
    run_controller(client, ctx).await
}
