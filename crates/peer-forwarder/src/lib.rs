// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Peer forwarding for clustered telemetry pipelines.
//!
//! Stateful processors (trace grouping, service maps) need every event that shares an
//! identification key on the same node. This crate decides which node owns each key with a
//! consistent hash ring, forwards events to their owner over HTTP(S), and lands events
//! received from peers in bounded per-processor receive buffers.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod certificate;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod forwarding_client;
pub mod hash_ring;
pub mod http_service;
pub mod http_utils;
pub mod metrics;
pub mod provider;
pub mod receive_buffer;
pub mod response_handler;
pub mod server;
pub mod tls;
