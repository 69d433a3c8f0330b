// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Response builders and request body limits shared by the forwarding endpoint.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::{
    header,
    http::{self, HeaderMap},
    Response, StatusCode,
};
use serde_json::json;
use tracing::{debug, error};

use crate::error::RequestError;

pub type HttpResponse = Response<Full<Bytes>>;

/// A `{"message": ...}` JSON response. The message is logged at error level unless `status`
/// is a success.
pub fn message_response(message: &str, status: StatusCode) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}

pub fn empty_response(status: StatusCode) -> http::Result<HttpResponse> {
    Response::builder().status(status).body(Full::new(Bytes::new()))
}

/// Rejects a request whose declared `Content-Length` is missing, malformed or above
/// `max_content_length`. Chunked requests declare no length and are bounded by
/// [`read_limited`] instead.
pub fn check_declared_length(
    headers: &HeaderMap,
    max_content_length: usize,
) -> Result<(), RequestError> {
    let Some(declared) = headers.get(header::CONTENT_LENGTH) else {
        if headers.contains_key(header::TRANSFER_ENCODING) {
            return Ok(());
        }
        return Err(RequestError::LengthRequired(
            "Forwarded batch has neither Content-Length nor Transfer-Encoding".to_string(),
        ));
    };
    let length = declared
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .ok_or_else(|| {
            RequestError::Decode(format!("Invalid Content-Length header: {declared:?}"))
        })?;
    if length > max_content_length {
        return Err(too_large(max_content_length));
    }
    Ok(())
}

/// Collects a request body, giving up with [`RequestError::Overflow`] as soon as more than
/// `max_content_length` bytes have arrived.
pub async fn read_limited<B>(body: B, max_content_length: usize) -> Result<Bytes, RequestError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, max_content_length).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(too_large(max_content_length)),
        Err(e) => Err(RequestError::Unknown(format!("Unable to read request body: {e}"))),
    }
}

fn too_large(max_content_length: usize) -> RequestError {
    RequestError::Overflow(format!(
        "Forwarded batch is larger than the {max_content_length} byte request limit"
    ))
}
