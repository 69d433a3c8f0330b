// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The `/peer_forwarder` endpoint: decode a batch, find its buffer, write it, answer.

use hyper::body::Body;
use hyper::{http, Method, Request, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::codec;
use crate::config::PeerForwarderConfiguration;
use crate::error::RequestError;
use crate::event::Event;
use crate::http_utils::{check_declared_length, empty_response, read_limited, HttpResponse};
use crate::metrics::{
    MetricsRecorder, RECORDS_RECEIVED_FROM_PEERS, SERVER_REQUEST_PROCESSING_LATENCY,
};
use crate::provider::PeerForwarderProvider;
use crate::response_handler::ResponseHandler;

pub const PEER_FORWARDER_PATH: &str = "/peer_forwarder";

/// Share of the request timeout a buffer write may use. The rest is left for the response.
pub const WRITE_TIMEOUT_FRACTION: f64 = 0.8;

#[derive(Clone)]
pub struct PeerForwarderHttpService {
    provider: Arc<PeerForwarderProvider>,
    response_handler: ResponseHandler,
    metrics: Arc<dyn MetricsRecorder>,
    request_timeout: Duration,
    write_timeout: Duration,
    max_content_length: usize,
    workers: Arc<Semaphore>,
    pending: Arc<Semaphore>,
}

impl PeerForwarderHttpService {
    pub fn new(
        provider: Arc<PeerForwarderProvider>,
        config: &PeerForwarderConfiguration,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let request_timeout = config.request_timeout();
        PeerForwarderHttpService {
            provider,
            response_handler: ResponseHandler::new(Arc::clone(&metrics)),
            metrics,
            request_timeout,
            write_timeout: request_timeout.mul_f64(WRITE_TIMEOUT_FRACTION),
            max_content_length: config.max_request_content_length,
            workers: Arc::new(Semaphore::new(config.server_thread_count)),
            pending: Arc::new(Semaphore::new(
                config.server_thread_count + config.max_pending_requests,
            )),
        }
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Entry point for every HTTP request the server accepts. Every rejection goes through
    /// the response handler so it is counted.
    pub async fn respond<B>(&self, request: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Err(error) = self.admit(&request) {
            return self.reject(&error);
        }

        // Requests beyond the workers plus the pending queue are turned away immediately
        let Ok(_admitted) = self.pending.try_acquire() else {
            return self.reject(&RequestError::Busy(
                "Too many pending peer forwarder requests".to_string(),
            ));
        };

        match tokio::time::timeout(self.request_timeout, self.run_on_worker(request)).await {
            Ok(response) => response,
            Err(_) => self.reject(&RequestError::Timeout(format!(
                "Request was not processed within {:?}",
                self.request_timeout
            ))),
        }
    }

    fn admit<B>(&self, request: &Request<B>) -> Result<(), RequestError> {
        if request.uri().path() != PEER_FORWARDER_PATH {
            return Err(RequestError::NotFound(format!(
                "Unknown path: {}",
                request.uri().path()
            )));
        }
        if request.method() != Method::POST {
            return Err(RequestError::MethodNotAllowed(format!(
                "Unsupported method: {}",
                request.method()
            )));
        }
        check_declared_length(request.headers(), self.max_content_length)
    }

    fn reject(&self, error: &RequestError) -> http::Result<HttpResponse> {
        self.response_handler.handle_error(error, &error.to_string())
    }

    async fn run_on_worker<B>(&self, request: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let Ok(_worker) = self.workers.acquire().await else {
            return self.reject(&RequestError::Busy(
                "Peer forwarder server is shutting down".to_string(),
            ));
        };
        match read_limited(request.into_body(), self.max_content_length).await {
            Ok(body) => self.handle(&body).await,
            Err(error) => self.reject(&error),
        }
    }

    /// Processes one forwarded batch and records how long it took.
    pub async fn handle(&self, body: &[u8]) -> http::Result<HttpResponse> {
        let start = Instant::now();
        let response = match self.process(body).await {
            Ok(count) => {
                self.metrics
                    .increment_counter(RECORDS_RECEIVED_FROM_PEERS, count as u64);
                empty_response(StatusCode::OK)
            }
            Err(error) => self.reject(&error),
        };
        self.metrics
            .record_latency(SERVER_REQUEST_PROCESSING_LATENCY, start.elapsed());
        response
    }

    async fn process(&self, body: &[u8]) -> Result<usize, RequestError> {
        let envelope = codec::decode::<Event>(body)?;
        let buffer = self
            .provider
            .get_receive_buffer(
                &envelope.destination_pipeline_name,
                &envelope.destination_plugin_id,
            )
            .ok_or_else(|| {
                RequestError::Unprocessable(format!(
                    "No peer forwarder receive buffer registered for pipeline {} and plugin {}",
                    envelope.destination_pipeline_name, envelope.destination_plugin_id
                ))
            })?;

        let count = envelope.events.len();
        buffer.write_all(envelope.events, self.write_timeout).await?;
        debug!(
            "Received {count} records for {}/{}",
            buffer.pipeline_name(),
            buffer.plugin_id()
        );
        Ok(count)
    }
}
