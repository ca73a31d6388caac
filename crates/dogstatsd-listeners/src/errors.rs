// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the DogStatsD listeners.

use std::io;

/// Errors surfaced while building or driving a listener.
///
/// Setup failures (`InvalidConfig`, `AddressResolution`, `Bind`, `SocketBuffer`) are returned
/// from construction and never retried. `AlreadyStarted` and `NotListening` reject lifecycle
/// transitions that are not allowed from the listener's current state.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid listener configuration: {0}")]
    InvalidConfig(String),

    #[error("can't resolve {addr}: {source}")]
    AddressResolution {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("can't listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not set socket rcvbuf to {size}: {source}")]
    SocketBuffer {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("listener already started or stopped")]
    AlreadyStarted,

    #[error("listener is not listening")]
    NotListening,
}

/// Outcome of a failed receive.
///
/// `Closed` is the shutdown signal for the read loop and is not counted as an error.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("use of closed network connection")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ListenerError::SocketBuffer {
            size: 4096,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(
            error.to_string(),
            "could not set socket rcvbuf to 4096: denied"
        );

        let error = ListenerError::InvalidConfig("packet buffer size must be positive".into());
        assert_eq!(
            error.to_string(),
            "invalid listener configuration: packet buffer size must be positive"
        );
    }

    #[test]
    fn test_bind_error_keeps_source() {
        use std::error::Error;

        let error = ListenerError::Bind {
            addr: "127.0.0.1:8125".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        assert!(error.to_string().starts_with("can't listen on 127.0.0.1:8125"));
        assert!(error.source().is_some());
    }

    #[test]
    fn test_read_error_closed_is_distinct() {
        let closed = ReadError::Closed;
        assert_eq!(closed.to_string(), "use of closed network connection");

        let transient: ReadError =
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(transient, ReadError::Io(_)));
        assert_eq!(transient.to_string(), "refused");
    }
}
