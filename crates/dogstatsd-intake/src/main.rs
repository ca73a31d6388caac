// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process, sync::Arc};
use tokio::{
    sync::mpsc,
    time::{interval, Duration},
};
use tracing::{debug, error, info, trace};
use tracing_subscriber::EnvFilter;

use dogstatsd_listeners::{CountingTelemetry, PacketPool, Packets, UdpListener, UdpListenerConfig};

const TELEMETRY_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level in configuration: {e}");
            process::exit(1);
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        process::exit(1);
    }

    debug!("Logging subsystem enabled");

    let config = match UdpListenerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error reading dogstatsd configuration: {e}");
            process::exit(1);
        }
    };
    debug!("dogstatsd configuration: {config:?}");

    let packet_pool = PacketPool::new(
        config.packet_buffer_size.saturating_mul(2),
        config.buffer_size,
    );
    let (packet_out, packet_in) = mpsc::channel::<Packets>(config.queue_size);
    let telemetry = CountingTelemetry::default();

    let listener = match UdpListener::new(
        &config,
        packet_out,
        packet_pool.clone(),
        Arc::new(telemetry.clone()),
    )
    .await
    {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!("Error starting dogstatsd-udp listener: {e}");
            process::exit(1);
        }
    };

    let listener_task = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.listen().await }
    });
    listener.wait_started().await;
    let consumer_task = tokio::spawn(consume_packets(packet_in, packet_pool.clone()));

    let mut telemetry_interval = interval(TELEMETRY_LOG_INTERVAL);
    telemetry_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            _ = telemetry_interval.tick() => {
                debug!(
                    "dogstatsd-udp telemetry: {}, pool: {:?}",
                    telemetry.snapshot(),
                    packet_pool.stats()
                );
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Unable to listen for shutdown signal: {e}");
                }
                info!("Shutting down dogstatsd-udp listener");
                break;
            }
        }
    }

    if let Err(e) = listener.stop().await {
        error!("Error stopping dogstatsd-udp listener: {e}");
    }
    match listener_task.await {
        Ok(Err(e)) => error!("dogstatsd-udp listener failed: {e}"),
        Err(e) => error!("dogstatsd-udp listener task failed: {e}"),
        Ok(Ok(())) => {}
    }

    // last sender goes away with the listener, letting the consumer drain and exit
    drop(listener);
    match consumer_task.await {
        Ok(total) => info!("dogstatsd-udp: processed {total} packets"),
        Err(e) => error!("dogstatsd-udp consumer task failed: {e}"),
    }

    if let Ok(expvar) = telemetry.to_expvar_json() {
        debug!("{expvar}");
    }
}

/// Drains batches and hands every buffer back to the pool. Returns the number of packets seen.
async fn consume_packets(
    mut packet_in: mpsc::Receiver<Packets>,
    packet_pool: PacketPool,
) -> u64 {
    let mut total: u64 = 0;
    while let Some(packets) = packet_in.recv().await {
        trace!("dogstatsd-udp: received batch of {} packets", packets.len());
        total += packets.len() as u64;
        packet_pool.release_all(packets);
    }
    total
}
