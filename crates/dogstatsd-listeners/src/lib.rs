// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! DogStatsD network intake.
//!
//! Receives DogStatsD datagrams over UDP, copies each one into a pooled buffer, groups the
//! packets into size- or time-bounded batches and forwards the batches on a bounded channel.
//!
//! ```text
//! UdpListener::listen ──> PacketPool::acquire ──> recv_from ──> PacketBuffer::append
//!                                                                     │ full or timed out
//!                                                                     v
//!       PacketPool::release <── consumer <── mpsc::Receiver<Packets> <─┘
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod errors;
pub mod packet;
pub mod packet_buffer;
pub mod telemetry;
pub mod udp;

pub use config::UdpListenerConfig;
pub use errors::{ListenerError, ReadError};
pub use packet::{Packet, PacketPool, Packets, PoolStats};
pub use packet_buffer::PacketBuffer;
pub use telemetry::{
    CountingTelemetry, ListenerTelemetry, NoopTelemetry, TelemetryCounters, TelemetrySnapshot,
};
pub use udp::{ListenerState, UdpListener};
