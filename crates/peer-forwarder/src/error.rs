// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors raised while parsing or validating the peer forwarder configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unable to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode events: {0}")]
    Encoding(String),

    #[error("Failed to decode events: {0}")]
    Decoding(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The batch is larger than the buffer could ever hold.
    #[error("Unable to write {requested} records to a buffer of capacity {capacity}")]
    Overflow { requested: usize, capacity: usize },

    /// No room was made within the write timeout, or the write was cancelled by shutdown.
    #[error("Timed out after {0:?} waiting for buffer space")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("No certificates found in PEM")]
    NoCertificates,

    #[error("No private key found in PEM")]
    NoPrivateKey,

    #[error("Unable to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Unable to build client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("Unable to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Fatal errors raised while building or starting the peer forwarder server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Unable to load certificate: {0}")]
    Certificate(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("Unable to bind peer forwarder server to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer forwarder server already started")]
    AlreadyStarted,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardingError {
    #[error("Dead letter policy configured without a dead letter sink")]
    MissingDeadLetterSink,
}

/// Every failure the inbound endpoint can hit, mapped one-to-one onto a status code.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{0}")]
    Overflow(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    Decode(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    #[error("{0}")]
    LengthRequired(String),

    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    Unknown(String),
}

impl From<BufferError> for RequestError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Overflow { .. } => RequestError::Overflow(err.to_string()),
            BufferError::Timeout(_) => RequestError::Timeout(err.to_string()),
        }
    }
}

impl From<CodecError> for RequestError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Decoding(_) => RequestError::Decode(err.to_string()),
            CodecError::Encoding(_) => RequestError::Unknown(err.to_string()),
        }
    }
}
