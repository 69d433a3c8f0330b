// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::{http, StatusCode};
use std::sync::Arc;

use crate::error::RequestError;
use crate::http_utils::{message_response, HttpResponse};
use crate::metrics::{
    MetricsRecorder, BAD_REQUESTS, REQUESTS_REJECTED, REQUESTS_TOO_LARGE, REQUESTS_UNPROCESSABLE,
    REQUEST_TIMEOUTS,
};

/// Maps a failed inbound request onto a status code and exactly one counter.
#[derive(Clone)]
pub struct ResponseHandler {
    metrics: Arc<dyn MetricsRecorder>,
}

impl ResponseHandler {
    pub fn new(metrics: Arc<dyn MetricsRecorder>) -> Self {
        ResponseHandler { metrics }
    }

    pub fn handle_error(&self, error: &RequestError, message: &str) -> http::Result<HttpResponse> {
        let (status, counter) = status_and_counter(error);
        self.metrics.increment_counter(counter, 1);
        message_response(message, status)
    }
}

pub fn status_and_counter(error: &RequestError) -> (StatusCode, &'static str) {
    match error {
        RequestError::Overflow(_) => (StatusCode::PAYLOAD_TOO_LARGE, REQUESTS_TOO_LARGE),
        RequestError::Timeout(_) => (StatusCode::REQUEST_TIMEOUT, REQUEST_TIMEOUTS),
        RequestError::Unprocessable(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, REQUESTS_UNPROCESSABLE)
        }
        RequestError::NotFound(_) => (StatusCode::NOT_FOUND, BAD_REQUESTS),
        RequestError::MethodNotAllowed(_) => (StatusCode::METHOD_NOT_ALLOWED, BAD_REQUESTS),
        RequestError::LengthRequired(_) => (StatusCode::LENGTH_REQUIRED, BAD_REQUESTS),
        RequestError::Busy(_) => (StatusCode::SERVICE_UNAVAILABLE, REQUESTS_REJECTED),
        RequestError::Decode(_) | RequestError::Unknown(_) => {
            (StatusCode::BAD_REQUEST, BAD_REQUESTS)
        }
    }
}
