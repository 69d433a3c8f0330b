// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use async_trait::async_trait;
use peer_forwarder::certificate::{Certificate, CertificateProvider};
use peer_forwarder::config::PeerForwarderConfiguration;
use peer_forwarder::error::TlsError;
use peer_forwarder::event::Event;
use peer_forwarder::forwarding_client::DeadLetterSink;
use peer_forwarder::hash_ring::ClusterState;
use peer_forwarder::metrics::MetricsRecorder;
use peer_forwarder::provider::PeerForwarderProvider;
use peer_forwarder::receive_buffer::ReceiveBuffer;
use peer_forwarder::server::{PeerForwarderHttpServerProvider, ServerHandle};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const PIPELINE: &str = "traces";
pub const PLUGIN: &str = "service-map";

pub fn trace_event(trace_id: usize) -> Event {
    match json!({ "traceId": format!("trace-{trace_id}"), "spanId": trace_id }) {
        serde_json::Value::Object(map) => Event::new(map),
        _ => unreachable!(),
    }
}

pub fn trace_events(count: usize) -> Vec<Event> {
    (0..count).map(trace_event).collect()
}

pub fn trace_keys() -> Vec<String> {
    vec!["traceId".to_string()]
}

/// Self-signed certificate valid for the loopback address.
pub fn self_signed_certificate() -> Certificate {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string(), "localhost".to_string()])
            .expect("Failed to generate certificate");
    Certificate::from_pem(cert.pem(), key_pair.serialize_pem()).expect("Invalid certificate")
}

/// Leaf signed by a throwaway CA. The PEM carries the leaf followed by the CA.
pub fn ca_signed_certificate() -> Certificate {
    let ca_key = KeyPair::generate().expect("Failed to generate CA key");
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "peer forwarder test CA");
    let ca_cert = ca_params.self_signed(&ca_key).expect("Failed to sign CA");

    let leaf_key = KeyPair::generate().expect("Failed to generate leaf key");
    let mut leaf_params =
        CertificateParams::new(vec!["127.0.0.1".to_string(), "localhost".to_string()])
            .expect("Leaf params");
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, "peer forwarder test node");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("Failed to sign leaf");

    Certificate::from_pem(
        format!("{}{}", leaf_cert.pem(), ca_cert.pem()),
        leaf_key.serialize_pem(),
    )
    .expect("Invalid certificate")
}

/// A started receiving node listening on a free loopback port.
pub struct ReceivingNode {
    pub handle: ServerHandle,
    pub addr: SocketAddr,
    pub buffer: Arc<ReceiveBuffer<Event>>,
}

/// Starts a server whose registry requires forwarding for `traces/service-map`.
pub async fn start_receiving_node(
    config: PeerForwarderConfiguration,
    certificate: Option<Certificate>,
    metrics: Arc<dyn MetricsRecorder>,
) -> ReceivingNode {
    let config = Arc::new(config);
    let cluster = Arc::new(ClusterState::with_peers(
        "127.0.0.1:1",
        config.port(),
        32,
        ["127.0.0.1:1", "127.0.0.1:2"],
    ));
    let mut registry = PeerForwarderProvider::builder(Arc::clone(&config), cluster);
    let buffer = registry.register(PIPELINE, PLUGIN, trace_keys());
    let provider = Arc::new(registry.build());

    let certificate_provider = certificate.map(|certificate| {
        Arc::new(StaticCertificate(certificate)) as Arc<dyn CertificateProvider>
    });
    let server_provider = PeerForwarderHttpServerProvider::new(config, certificate_provider);
    let ServerHandle::Remote(server) = ServerHandle::from_provider(provider, &server_provider, metrics)
        .expect("Failed to build server")
    else {
        panic!("expected a remote server");
    };

    let mut handle =
        ServerHandle::Remote(server.with_bind_addr(SocketAddr::from(([127, 0, 0, 1], 0))));
    handle.start().await.expect("Failed to start server");
    let addr = handle.local_addr().expect("Server has no address");
    ReceivingNode {
        handle,
        addr,
        buffer,
    }
}

/// A peer that accepts connections and holds them open without ever answering.
pub async fn start_silent_peer() -> (SocketAddr, JoinHandle<Vec<TcpStream>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind silent peer");
    let addr = listener.local_addr().expect("Silent peer has no address");
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
        held
    });
    (addr, handle)
}

struct StaticCertificate(Certificate);

impl CertificateProvider for StaticCertificate {
    fn certificate(&self) -> Result<Certificate, TlsError> {
        Ok(self.0.clone())
    }
}

/// Dead letter sink that remembers every batch it was handed.
#[derive(Default)]
pub struct RecordingDeadLetterSink {
    pub batches: Mutex<Vec<(String, String, usize, String)>>,
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn send(
        &self,
        pipeline_name: &str,
        plugin_id: &str,
        events: Vec<Event>,
        reason: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.batches.lock().expect("poisoned").push((
            pipeline_name.to_string(),
            plugin_id.to_string(),
            events.len(),
            reason.to_string(),
        ));
        Ok(())
    }
}
