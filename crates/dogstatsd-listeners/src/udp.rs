// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! DogStatsD UDP listener.
//!
//! The listener owns the bound socket and runs the intake loop: take a packet from the pool,
//! receive one datagram into it, hand it to the [`PacketBuffer`]. Batches leave through the
//! output channel given at construction.
//!
//! Lifecycle is `Idle -> Listening -> Stopped`. Only one task can move the listener out of
//! `Idle`, and that task takes the socket for the duration of the intake loop, so the socket
//! always has a single reader. `stop` closes the packet buffer first, which flushes the pending
//! batch, then cancels the pending receive. The socket is closed when the loop exits.
//!
//! Origin detection is not implemented for UDP: datagrams carry no credentials, every packet is
//! anonymous.

use crate::config::UdpListenerConfig;
use crate::errors::{ListenerError, ReadError};
use crate::packet::{PacketPool, Packets};
use crate::packet_buffer::PacketBuffer;
use crate::telemetry::ListenerTelemetry;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[cfg(test)]
use {std::collections::VecDeque, std::io};

/// Lifecycle state of a [`UdpListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Socket bound, intake loop not started
    Idle,
    /// Intake loop running
    Listening,
    /// Stopped for good, the listener is not restartable
    Stopped,
}

// BufferReader abstracts where datagrams come from.
enum BufferReader {
    /// Bound UDP socket
    UdpSocket(tokio::net::UdpSocket),

    /// Replays scripted receive results, then waits for shutdown
    #[cfg(test)]
    Scripted(Mutex<VecDeque<io::Result<Vec<u8>>>>),
}

impl BufferReader {
    /// Receives one datagram into `buf` and returns its length.
    ///
    /// Returns [`ReadError::Closed`] once `cancel_token` fires, which is how a pending receive
    /// is interrupted on shutdown.
    async fn read(
        &self,
        buf: &mut [u8],
        cancel_token: &CancellationToken,
    ) -> Result<usize, ReadError> {
        match self {
            BufferReader::UdpSocket(socket) => {
                tokio::select! {
                    biased;
                    () = cancel_token.cancelled() => Err(ReadError::Closed),
                    received = socket.recv_from(buf) => {
                        let (amt, _src) = received?;
                        Ok(amt)
                    }
                }
            }
            #[cfg(test)]
            BufferReader::Scripted(script) => {
                if cancel_token.is_cancelled() {
                    return Err(ReadError::Closed);
                }
                let next = script
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                match next {
                    Some(Ok(data)) => {
                        let amt = data.len().min(buf.len());
                        buf[..amt].copy_from_slice(&data[..amt]);
                        Ok(amt)
                    }
                    Some(Err(e)) => Err(ReadError::Io(e)),
                    None => {
                        cancel_token.cancelled().await;
                        Err(ReadError::Closed)
                    }
                }
            }
        }
    }
}

/// DogStatsD UDP listener.
pub struct UdpListener {
    // Taken by the intake loop, dropped when it exits.
    reader: Mutex<Option<BufferReader>>,
    local_addr: SocketAddr,
    packet_pool: PacketPool,
    packet_buffer: PacketBuffer,
    telemetry: Arc<dyn ListenerTelemetry>,
    state: watch::Sender<ListenerState>,
    cancel_token: CancellationToken,
}

impl UdpListener {
    /// Binds the socket and wires the packet buffer to `packet_out`. The listener starts `Idle`.
    ///
    /// Binds every interface when `non_local_traffic` is set, `bind_host` otherwise, and applies
    /// `so_rcvbuf` when it is non-zero. Must be called from within a Tokio runtime.
    pub async fn new(
        config: &UdpListenerConfig,
        packet_out: mpsc::Sender<Packets>,
        packet_pool: PacketPool,
        telemetry: Arc<dyn ListenerTelemetry>,
    ) -> Result<Self, ListenerError> {
        config.validate()?;
        let socket = bind_socket(config).await?;
        let local_addr = socket.local_addr().map_err(|source| ListenerError::Bind {
            addr: config.bind_address(),
            source,
        })?;
        debug!("dogstatsd-udp: {} successfully initialized", local_addr);

        Ok(Self::with_reader(
            BufferReader::UdpSocket(socket),
            local_addr,
            config,
            packet_out,
            packet_pool,
            telemetry,
        ))
    }

    fn with_reader(
        reader: BufferReader,
        local_addr: SocketAddr,
        config: &UdpListenerConfig,
        packet_out: mpsc::Sender<Packets>,
        packet_pool: PacketPool,
        telemetry: Arc<dyn ListenerTelemetry>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            reader: Mutex::new(Some(reader)),
            local_addr,
            packet_pool,
            packet_buffer: PacketBuffer::new(
                config.packet_buffer_size,
                config.packet_buffer_flush_timeout,
                packet_out,
            ),
            telemetry,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Address the socket is bound to. Resolves an ephemeral port request.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Waits until the listener has left `Idle` and returns the state it moved to.
    ///
    /// A caller that spawned [`UdpListener::listen`] can use this before relying on
    /// [`UdpListener::stop`], which rejects a listener that has not started yet.
    pub async fn wait_started(&self) -> ListenerState {
        let mut state_rx = self.state.subscribe();
        let state = match state_rx
            .wait_for(|state| *state != ListenerState::Idle)
            .await
        {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Runs the intake loop until [`UdpListener::stop`] is called. Should be spawned on its
    /// own task.
    ///
    /// Fails with [`ListenerError::AlreadyStarted`] unless the listener is `Idle`.
    pub async fn listen(&self) -> Result<(), ListenerError> {
        let started = self.state.send_if_modified(|state| {
            if *state != ListenerState::Idle {
                return false;
            }
            *state = ListenerState::Listening;
            true
        });
        if !started {
            return Err(ListenerError::AlreadyStarted);
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            return Err(ListenerError::AlreadyStarted);
        };

        info!("dogstatsd-udp: starting to listen on {}", self.local_addr);
        loop {
            let mut packet = self.packet_pool.acquire();
            match reader.read(packet.buffer_mut(), &self.cancel_token).await {
                Ok(amt) => {
                    packet.set_len(amt);
                    self.telemetry.on_packet();
                    // the packet buffer forwards batches to the intake channel
                    self.packet_buffer.append(packet).await;
                }
                Err(ReadError::Closed) => {
                    self.packet_pool.release(packet);
                    break;
                }
                Err(ReadError::Io(e)) => {
                    error!("dogstatsd-udp: error reading packet: {}", e);
                    self.telemetry.on_read_error();
                    self.packet_pool.release(packet);
                }
            }
        }

        drop(reader);
        debug!("dogstatsd-udp: stopped listening on {}", self.local_addr);
        Ok(())
    }

    /// Flushes pending packets, then interrupts the intake loop.
    ///
    /// A second call is a no-op. Fails with [`ListenerError::NotListening`] if the listener
    /// never started.
    pub async fn stop(&self) -> Result<(), ListenerError> {
        let mut previous = ListenerState::Idle;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state != ListenerState::Listening {
                return false;
            }
            *state = ListenerState::Stopped;
            true
        });
        match previous {
            ListenerState::Listening => {}
            ListenerState::Stopped => {
                debug!("dogstatsd-udp: listener already stopped");
                return Ok(());
            }
            ListenerState::Idle => return Err(ListenerError::NotListening),
        }

        self.packet_buffer.close().await;
        self.cancel_token.cancel();
        debug!("dogstatsd-udp: stopping listener on {}", self.local_addr);
        Ok(())
    }
}

async fn bind_socket(
    config: &UdpListenerConfig,
) -> Result<tokio::net::UdpSocket, ListenerError> {
    let url = config.bind_address();
    let addr = tokio::net::lookup_host(&url)
        .await
        .map_err(|source| ListenerError::AddressResolution {
            addr: url.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| ListenerError::AddressResolution {
            addr: url.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address found"),
        })?;

    let bind_error = |source| ListenerError::Bind {
        addr: url.clone(),
        source,
    };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_error)?;

    if config.so_rcvbuf != 0 {
        socket
            .set_recv_buffer_size(config.so_rcvbuf)
            .map_err(|source| ListenerError::SocketBuffer {
                size: config.so_rcvbuf,
                source,
            })?;
    }

    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;

    let std_socket: std::net::UdpSocket = socket.into();
    tokio::net::UdpSocket::from_std(std_socket).map_err(bind_error)
}
