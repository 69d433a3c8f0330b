// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::{bail, Context};
use std::{env, sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use peer_forwarder::{
    certificate::{CertificateProvider, FileCertificateProvider},
    config::PeerForwarderConfiguration,
    discovery::{peer_list_provider_from_config, refresh_peers, spawn_refresh},
    event::Event,
    hash_ring::ClusterState,
    metrics::{InMemoryMetrics, SERVER_REQUEST_PROCESSING_LATENCY},
    provider::PeerForwarderProvider,
    receive_buffer::ReceiveBuffer,
    server::{PeerForwarderHttpServerProvider, ServerHandle},
};

/// A processor that wants its events routed by identification key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PipelineRegistration {
    pipeline_name: String,
    plugin_id: String,
    identification_keys: Vec<String>,
}

/// Parses `PEER_FORWARDER_PIPELINES`, e.g. `traces/service-map=traceId;logs/dedupe=host,service`.
fn parse_registrations(value: &str) -> anyhow::Result<Vec<PipelineRegistration>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (target, keys) = entry
                .split_once('=')
                .with_context(|| format!("Missing '=' in pipeline registration '{entry}'"))?;
            let (pipeline_name, plugin_id) = target
                .split_once('/')
                .with_context(|| format!("Expected pipeline/plugin in '{target}'"))?;
            let (pipeline_name, plugin_id) = (pipeline_name.trim(), plugin_id.trim());
            if pipeline_name.is_empty() || plugin_id.is_empty() {
                bail!("Empty pipeline or plugin name in '{entry}'");
            }
            Ok(PipelineRegistration {
                pipeline_name: pipeline_name.to_string(),
                plugin_id: plugin_id.to_string(),
                identification_keys: keys
                    .split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("PEER_FORWARDER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run().await {
        error!("Peer forwarder node stopped: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Arc::new(
        PeerForwarderConfiguration::from_env().context("Unable to load configuration")?,
    );
    let cluster = Arc::new(ClusterState::from_config(&config));

    let peer_list_provider = peer_list_provider_from_config(&config);
    refresh_peers(&cluster, peer_list_provider.as_ref()).await;

    let shutdown = CancellationToken::new();
    let refresh = spawn_refresh(
        Arc::clone(&cluster),
        peer_list_provider,
        config.peer_refresh_interval(),
        shutdown.child_token(),
    );

    let registrations = match env::var("PEER_FORWARDER_PIPELINES") {
        Ok(value) => parse_registrations(&value)?,
        Err(_) => Vec::new(),
    };
    let mut registry = PeerForwarderProvider::builder(Arc::clone(&config), Arc::clone(&cluster))
        .with_shutdown(shutdown.child_token());
    for registration in registrations {
        registry.register(
            &registration.pipeline_name,
            &registration.plugin_id,
            registration.identification_keys,
        );
    }
    let provider = Arc::new(registry.build());

    let certificate_provider = config.ssl.then(|| {
        Arc::new(FileCertificateProvider::new(
            &config.ssl_certificate_file,
            &config.ssl_key_file,
        )) as Arc<dyn CertificateProvider>
    });
    let server_provider =
        PeerForwarderHttpServerProvider::new(Arc::clone(&config), certificate_provider);
    let metrics = Arc::new(InMemoryMetrics::new());
    let mut server =
        ServerHandle::from_provider(Arc::clone(&provider), &server_provider, metrics.clone())?;
    server.start().await?;
    if !server.is_remote() {
        info!("Peer forwarding is not required on this node, not accepting forwarded records");
    }

    let mut drains = JoinSet::new();
    for buffer in provider.receive_buffers() {
        drains.spawn(drain(
            buffer,
            config.batch_size,
            config.batch_delay(),
            shutdown.clone(),
        ));
    }

    wait_for_shutdown().await;

    server.stop().await;
    shutdown.cancel();
    while drains.join_next().await.is_some() {}
    if let Err(e) = refresh.await {
        error!("Peer list refresh task failed: {e}");
    }

    for (name, value) in metrics.counters() {
        info!("{name}: {value}");
    }
    let latency = metrics.timer(SERVER_REQUEST_PROCESSING_LATENCY);
    if let Some(mean) = latency.mean() {
        info!(
            "{SERVER_REQUEST_PROCESSING_LATENCY}: {} requests, mean {mean:?}, max {:?}",
            latency.count, latency.max
        );
    }
    Ok(())
}

/// Stands in for the pipeline worker that would read each receive buffer.
async fn drain(
    buffer: Arc<ReceiveBuffer<Event>>,
    batch_size: usize,
    batch_delay: Duration,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let records = buffer.read_batch(batch_size, batch_delay).await;
        if !records.is_empty() {
            debug!(
                "Read {} forwarded records for {}/{}",
                records.len(),
                buffer.pipeline_name(),
                buffer.plugin_id()
            );
        }
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Failed to listen for SIGTERM: {e}");
                    wait_for_ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            () = wait_for_ctrl_c() => {}
            _ = terminate.recv() => info!("Received SIGTERM, initiating shutdown"),
        }
    }
    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}
