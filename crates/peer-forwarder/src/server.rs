// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The inbound listener and its start/stop lifecycle.
//!
//! A node that has nothing to forward runs [`NoOpPeerForwarderServer`]. Otherwise
//! [`RemotePeerForwarderServer`] binds the configured port, optionally terminates TLS, and
//! serves [`PeerForwarderHttpService`] with bounded connections. The choice is made once, at
//! startup, by [`ServerHandle::from_provider`].

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::certificate::CertificateProvider;
use crate::config::PeerForwarderConfiguration;
use crate::error::ServerError;
use crate::http_service::PeerForwarderHttpService;
use crate::metrics::MetricsRecorder;
use crate::provider::PeerForwarderProvider;
use crate::tls::server_tls_config;

/// Builds the listener described by the configuration.
pub struct PeerForwarderHttpServerProvider {
    config: Arc<PeerForwarderConfiguration>,
    certificate_provider: Option<Arc<dyn CertificateProvider>>,
}

impl PeerForwarderHttpServerProvider {
    pub fn new(
        config: Arc<PeerForwarderConfiguration>,
        certificate_provider: Option<Arc<dyn CertificateProvider>>,
    ) -> Self {
        PeerForwarderHttpServerProvider {
            config,
            certificate_provider,
        }
    }

    /// Loads the certificate and TLS settings. Any failure here is fatal to startup.
    pub fn build(
        &self,
        service: PeerForwarderHttpService,
    ) -> Result<RemotePeerForwarderServer, ServerError> {
        let tls = if self.config.ssl {
            let certificate_provider = self.certificate_provider.as_ref().ok_or_else(|| {
                ServerError::Certificate(
                    "SSL is enabled but no certificate was provided".to_string(),
                )
            })?;
            let certificate = certificate_provider.certificate()?;
            let tls_config = server_tls_config(
                &certificate,
                self.config.is_mutual_tls(),
                self.config.ssl_fingerprint_verification_only,
            )?;
            Some(TlsAcceptor::from(tls_config))
        } else {
            warn!("Creating non-SSL peer forwarder server. This is not secure and should not be used in production.");
            None
        };

        Ok(RemotePeerForwarderServer {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], self.config.port())),
            tls,
            service,
            max_connections: self.config.max_connection_count,
            handshake_timeout: self.config.request_timeout(),
            drain_timeout: self.config.drain_timeout(),
            running: None,
        })
    }
}

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct RemotePeerForwarderServer {
    bind_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    service: PeerForwarderHttpService,
    max_connections: usize,
    handshake_timeout: Duration,
    drain_timeout: Duration,
    running: Option<Running>,
}

impl RemotePeerForwarderServer {
    /// Overrides the bind address. Port 0 picks a free port, see [`Self::local_addr`].
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    /// Binds the listener and starts accepting. Returns once the port is bound.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.bind_addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.bind_addr.to_string(),
            source,
        })?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            self.tls.clone(),
            self.service.clone(),
            ConnectionLimits {
                max_connections: self.max_connections,
                handshake_timeout: self.handshake_timeout,
                drain_timeout: self.drain_timeout,
            },
            cancel.clone(),
        ));
        info!(
            "Peer forwarder server listening on {local_addr} ({})",
            if self.tls.is_some() { "https" } else { "http" }
        );
        self.running = Some(Running {
            local_addr,
            cancel,
            task,
        });
        Ok(())
    }

    /// Stops accepting, waits up to the drain timeout for open connections, then closes them.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            error!("Peer forwarder server task failed: {e}");
        }
        info!("Peer forwarder server stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPeerForwarderServer;

impl NoOpPeerForwarderServer {
    pub async fn start(&mut self) -> Result<(), ServerError> {
        debug!("Peer forwarding not required, not starting peer forwarder server");
        Ok(())
    }

    pub async fn stop(&mut self) {}
}

/// The server strategy picked at startup. Callers use the same start/stop calls either way.
pub enum ServerHandle {
    NoOp(NoOpPeerForwarderServer),
    Remote(RemotePeerForwarderServer),
}

impl ServerHandle {
    pub fn from_provider(
        provider: Arc<PeerForwarderProvider>,
        server_provider: &PeerForwarderHttpServerProvider,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Self, ServerError> {
        if !provider.is_peer_forwarding_required() {
            return Ok(ServerHandle::NoOp(NoOpPeerForwarderServer));
        }
        let config = Arc::clone(provider.config());
        let service = PeerForwarderHttpService::new(provider, &config, metrics);
        Ok(ServerHandle::Remote(server_provider.build(service)?))
    }

    pub async fn start(&mut self) -> Result<(), ServerError> {
        match self {
            ServerHandle::NoOp(server) => server.start().await,
            ServerHandle::Remote(server) => server.start().await,
        }
    }

    pub async fn stop(&mut self) {
        match self {
            ServerHandle::NoOp(server) => server.stop().await,
            ServerHandle::Remote(server) => server.stop().await,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerHandle::NoOp(_) => None,
            ServerHandle::Remote(server) => server.local_addr(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ServerHandle::Remote(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionLimits {
    max_connections: usize,
    handshake_timeout: Duration,
    drain_timeout: Duration,
}

async fn serve(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    service: PeerForwarderHttpService,
    limits: ConnectionLimits,
    cancel: CancellationToken,
) {
    let connections = Arc::new(Semaphore::new(limits.max_connections));
    let mut joinset = JoinSet::new();

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&connections).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(finished) = joinset.join_next(), if !joinset.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Peer forwarder connection task panicked: {e}");
                    }
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };
        let (conn, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) if is_dropped_connection(&e) => {
                debug!("Peer connection dropped before accept: {e}");
                continue;
            }
            Err(e) => {
                error!("Peer forwarder server accept error: {e}");
                continue;
            }
        };

        joinset.spawn(handle_connection(
            conn,
            peer_addr,
            tls.clone(),
            service.clone(),
            limits.handshake_timeout,
            cancel.clone(),
            permit,
        ));
    }

    drop(listener);
    if joinset.is_empty() {
        return;
    }
    debug!("Draining {} peer forwarder connections", joinset.len());
    let drained = tokio::time::timeout(limits.drain_timeout, async {
        while joinset.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Closing {} peer forwarder connections still open after {:?}",
            joinset.len(),
            limits.drain_timeout
        );
        joinset.shutdown().await;
    }
}

fn is_dropped_connection(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// Completes the TLS handshake when the server is encrypted, then serves HTTP on the
/// connection. The permit is held until the connection closes.
async fn handle_connection(
    conn: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    service: PeerForwarderHttpService,
    handshake_timeout: Duration,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let Some(acceptor) = tls else {
        serve_connection(conn, service, cancel).await;
        return;
    };
    match tokio::time::timeout(handshake_timeout, acceptor.accept(conn)).await {
        Ok(Ok(stream)) => serve_connection(stream, service, cancel).await,
        Ok(Err(e)) => debug!("TLS handshake with {peer_addr} failed: {e}"),
        Err(_) => debug!("TLS handshake with {peer_addr} timed out"),
    }
}

async fn serve_connection<I>(io: I, service: PeerForwarderHttpService, cancel: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| {
        let service = service.clone();
        async move { service.respond(request).await }
    });
    let server = hyper::server::conn::http1::Builder::new();
    let conn = server.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("Peer forwarder connection error: {e}");
            }
        }
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!("Peer forwarder connection error during shutdown: {e}");
            }
        }
    }
}
