// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Listener telemetry.
//!
//! The listener reports through the [`ListenerTelemetry`] trait so the host decides where the
//! signals end up. [`CountingTelemetry`] keeps relaxed atomic counters that an external metrics
//! reporter can read, and can render them in the agent's expvar layout.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Observer for listener activity.
pub trait ListenerTelemetry: Send + Sync {
    /// A datagram was received and handed to the packet buffer.
    fn on_packet(&self);

    /// A receive failed for a reason other than shutdown.
    fn on_read_error(&self);
}

/// Counters shared between the listener and whoever reports them.
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    packets: AtomicU64,
    packet_reading_errors: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            packet_reading_errors: self.packet_reading_errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TelemetrySnapshot {
    /// Number of datagrams received.
    #[serde(rename = "Packets")]
    pub packets: u64,
    /// Number of failed receives, shutdown excluded.
    #[serde(rename = "PacketReadingErrors")]
    pub packet_reading_errors: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets={}, packet_reading_errors={}",
            self.packets, self.packet_reading_errors
        )
    }
}

/// Telemetry implementation backed by [`TelemetryCounters`].
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counter set.
    pub fn counters(&self) -> Arc<TelemetryCounters> {
        Arc::clone(&self.counters)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.counters.snapshot()
    }

    /// Renders the counters as `{"dogstatsd-udp": {"Packets": .., "PacketReadingErrors": ..}}`.
    pub fn to_expvar_json(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Expvar {
            #[serde(rename = "dogstatsd-udp")]
            udp: TelemetrySnapshot,
        }

        serde_json::to_string(&Expvar {
            udp: self.snapshot(),
        })
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl ListenerTelemetry for CountingTelemetry {
    fn on_packet(&self) {
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
    }

    fn on_read_error(&self) {
        self.counters
            .packet_reading_errors
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Telemetry sink that discards every signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl ListenerTelemetry for NoopTelemetry {
    fn on_packet(&self) {}

    fn on_read_error(&self) {}
}
