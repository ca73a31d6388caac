// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ListenerError;
use std::env;
use std::time::Duration;

pub const DEFAULT_DOGSTATSD_PORT: u16 = 8125;
pub const DEFAULT_BIND_HOST: &str = "localhost";
// Max datagram size is configurable in the Go Agent with a default of 8KB
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_PACKET_BUFFER_SIZE: usize = 32;
pub const DEFAULT_PACKET_BUFFER_FLUSH_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

// Largest UDP payload
pub const MAX_BUFFER_SIZE: usize = 65_535;
pub const MAX_PACKET_BUFFER_SIZE: usize = 4096;
pub const MAX_QUEUE_SIZE: usize = 1 << 20;

/// Configuration for the DogStatsD UDP listener. Read once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpListenerConfig {
    /// Listen on all interfaces instead of `bind_host`
    pub non_local_traffic: bool,
    /// Host to bind the UDP socket to when `non_local_traffic` is off (e.g., "127.0.0.1")
    pub bind_host: String,
    /// Port to bind the UDP socket to, 0 picks an ephemeral port
    pub port: u16,
    /// SO_RCVBUF override in bytes, 0 keeps the OS default
    pub so_rcvbuf: usize,
    /// Capacity of each pooled receive buffer in bytes
    pub buffer_size: usize,
    /// Maximum number of packets per batch
    pub packet_buffer_size: usize,
    /// Maximum time a non-empty batch waits before being flushed
    pub packet_buffer_flush_timeout: Duration,
    /// Number of batches the output channel holds before flushes block
    pub queue_size: usize,
}

impl Default for UdpListenerConfig {
    fn default() -> Self {
        Self {
            non_local_traffic: false,
            bind_host: DEFAULT_BIND_HOST.to_string(),
            port: DEFAULT_DOGSTATSD_PORT,
            so_rcvbuf: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            packet_buffer_size: DEFAULT_PACKET_BUFFER_SIZE,
            packet_buffer_flush_timeout: DEFAULT_PACKET_BUFFER_FLUSH_TIMEOUT,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl UdpListenerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ListenerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Values that fail to parse fall back
    /// to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ListenerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|val| val.trim().parse::<usize>().ok());

        let non_local_traffic = lookup("DD_DOGSTATSD_NON_LOCAL_TRAFFIC")
            .map(|val| matches!(val.trim().to_lowercase().as_str(), "true" | "1"))
            .unwrap_or(defaults.non_local_traffic);
        let bind_host = lookup("DD_BIND_HOST")
            .map(|val| val.trim().to_string())
            .unwrap_or(defaults.bind_host);
        let port = lookup("DD_DOGSTATSD_PORT")
            .and_then(|port| port.trim().parse::<u16>().ok())
            .unwrap_or(defaults.port);
        let so_rcvbuf = parsed("DD_DOGSTATSD_SO_RCVBUF").unwrap_or(defaults.so_rcvbuf);
        let buffer_size = parsed("DD_DOGSTATSD_BUFFER_SIZE").unwrap_or(defaults.buffer_size);
        let packet_buffer_size =
            parsed("DD_DOGSTATSD_PACKET_BUFFER_SIZE").unwrap_or(defaults.packet_buffer_size);
        let packet_buffer_flush_timeout = lookup("DD_DOGSTATSD_PACKET_BUFFER_FLUSH_TIMEOUT")
            .and_then(|val| val.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.packet_buffer_flush_timeout);
        let queue_size = parsed("DD_DOGSTATSD_QUEUE_SIZE").unwrap_or(defaults.queue_size);

        let config = Self {
            non_local_traffic,
            bind_host,
            port,
            so_rcvbuf,
            buffer_size,
            packet_buffer_size,
            packet_buffer_flush_timeout,
            queue_size,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ListenerError> {
        if self.packet_buffer_size == 0 || self.packet_buffer_size > MAX_PACKET_BUFFER_SIZE {
            return Err(ListenerError::InvalidConfig(format!(
                "packet buffer size must be between 1 and {MAX_PACKET_BUFFER_SIZE}, got {}",
                self.packet_buffer_size
            )));
        }

        if self.packet_buffer_flush_timeout.is_zero() {
            return Err(ListenerError::InvalidConfig(
                "packet buffer flush timeout must be greater than 0".to_string(),
            ));
        }

        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ListenerError::InvalidConfig(format!(
                "receive buffer size must be between 1 and {MAX_BUFFER_SIZE} bytes, got {}",
                self.buffer_size
            )));
        }

        if self.queue_size == 0 || self.queue_size > MAX_QUEUE_SIZE {
            return Err(ListenerError::InvalidConfig(format!(
                "queue size must be between 1 and {MAX_QUEUE_SIZE}, got {}",
                self.queue_size
            )));
        }

        if !self.non_local_traffic && self.bind_host.trim().is_empty() {
            return Err(ListenerError::InvalidConfig(
                "bind host cannot be empty unless non-local traffic is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Address the socket binds to: every interface when non-local traffic is accepted,
    /// otherwise `bind_host`.
    #[must_use]
    pub fn bind_address(&self) -> String {
        if self.non_local_traffic {
            format!("0.0.0.0:{}", self.port)
        } else if self.bind_host.contains(':') && !self.bind_host.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.bind_host, self.port)
        } else {
            format!("{}:{}", self.bind_host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = UdpListenerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address(), "localhost:8125");
    }

    #[test]
    fn test_from_lookup_reads_every_setting() {
        let config = UdpListenerConfig::from_lookup(lookup_from(&[
            ("DD_DOGSTATSD_NON_LOCAL_TRAFFIC", "true"),
            ("DD_BIND_HOST", "127.0.0.1"),
            ("DD_DOGSTATSD_PORT", "18125"),
            ("DD_DOGSTATSD_SO_RCVBUF", "262144"),
            ("DD_DOGSTATSD_BUFFER_SIZE", "65535"),
            ("DD_DOGSTATSD_PACKET_BUFFER_SIZE", "10"),
            ("DD_DOGSTATSD_PACKET_BUFFER_FLUSH_TIMEOUT", "250"),
            ("DD_DOGSTATSD_QUEUE_SIZE", "16"),
        ]))
        .expect("config should be valid");

        assert!(config.non_local_traffic);
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.port, 18125);
        assert_eq!(config.so_rcvbuf, 262_144);
        assert_eq!(config.buffer_size, 65_535);
        assert_eq!(config.packet_buffer_size, 10);
        assert_eq!(
            config.packet_buffer_flush_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.queue_size, 16);
        assert_eq!(config.bind_address(), "0.0.0.0:18125");
    }

    #[test]
    fn test_from_lookup_falls_back_on_garbage() {
        let config = UdpListenerConfig::from_lookup(lookup_from(&[
            ("DD_DOGSTATSD_PORT", "not-a-port"),
            ("DD_DOGSTATSD_SO_RCVBUF", "-1"),
            ("DD_DOGSTATSD_PACKET_BUFFER_FLUSH_TIMEOUT", "soon"),
        ]))
        .expect("config should be valid");

        assert_eq!(config, UdpListenerConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let result = UdpListenerConfig::from_lookup(lookup_from(&[(
            "DD_DOGSTATSD_PACKET_BUFFER_SIZE",
            "0",
        )]));
        assert!(matches!(result, Err(ListenerError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = UdpListenerConfig {
            packet_buffer_flush_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UdpListenerConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UdpListenerConfig {
            queue_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_values() {
        let max = usize::MAX.to_string();
        for key in [
            "DD_DOGSTATSD_PACKET_BUFFER_SIZE",
            "DD_DOGSTATSD_BUFFER_SIZE",
            "DD_DOGSTATSD_QUEUE_SIZE",
        ] {
            let result = UdpListenerConfig::from_lookup(lookup_from(&[(key, max.as_str())]));
            assert!(
                matches!(result, Err(ListenerError::InvalidConfig(_))),
                "{key} accepted usize::MAX"
            );
        }

        let config = UdpListenerConfig {
            buffer_size: MAX_BUFFER_SIZE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UdpListenerConfig {
            buffer_size: MAX_BUFFER_SIZE,
            packet_buffer_size: MAX_PACKET_BUFFER_SIZE,
            queue_size: MAX_QUEUE_SIZE,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_bind_host() {
        let config = UdpListenerConfig {
            bind_host: "   ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UdpListenerConfig {
            bind_host: String::new(),
            non_local_traffic: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bind_address_ipv6() {
        let config = UdpListenerConfig {
            bind_host: "::1".to_string(),
            port: 9000,
            ..Default::default()
        };
        assert_eq!(config.bind_address(), "[::1]:9000");
    }
}
