//! Engine assembly and the main-loop broadcasters.
//!
//! `Server::start` brings up the transport, the classifier and the
//! dispatcher, then spins on their ready flags before letting the caller
//! start the periodic broadcasts — the original's initialization barrier.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use log::{debug, info};
use tokio::time::sleep;

use crate::classify;
use crate::handlers;
use crate::scheduler;
use crate::state::{BUSY_WAITING_TIME_IN_MS, ServerState};
use crate::udp::UdpTransport;
use crate::wire::{
    self, AreaScope, GeoFenceReloadKind, PktDirection, PktType, ReloadCommand,
};

pub struct Server {
    state: Arc<ServerState>,
    transport: UdpTransport,
    classifier: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Server {
    /// Start the packet engine. Returns once every component reported
    /// ready; any component flagging failure aborts startup.
    pub fn start(state: Arc<ServerState>) -> Result<Self> {
        if state.config.geofence.enabled {
            handlers::reload_geofence_settings(
                &state,
                ReloadCommand {
                    kind: GeoFenceReloadKind::All,
                    scope: AreaScope::All,
                },
            );
        }

        let transport = UdpTransport::start(Arc::clone(&state)).map_err(|err| {
            state.mark_failed();
            err
        })
        .context("initializing UDP transport")?;
        state.set_transport_ready();

        let classifier = thread::Builder::new()
            .name("classifier".into())
            .spawn({
                let state = Arc::clone(&state);
                move || classify::run_classifier(state)
            })
            .context("starting classifier thread")?;

        let dispatcher = thread::Builder::new()
            .name("dispatcher".into())
            .spawn({
                let state = Arc::clone(&state);
                move || scheduler::run_dispatcher(state)
            })
            .context("starting dispatcher thread")?;

        while !state.dispatcher_ready() {
            if state.failed() {
                bail!("engine initialization failed");
            }
            thread::sleep(Duration::from_millis(BUSY_WAITING_TIME_IN_MS));
        }

        info!("server ready on {}", transport.recv_addr());
        Ok(Self {
            state,
            transport,
            classifier,
            dispatcher,
        })
    }

    pub fn recv_addr(&self) -> SocketAddr {
        self.transport.recv_addr()
    }

    /// Stop every engine thread and drain the queues.
    pub fn shutdown(self) {
        self.state.shutdown();
        let _ = self.classifier.join();
        let _ = self.dispatcher.join();
        self.transport.join();
        self.state.inbound.release();
        self.state.outbound.release();
        info!("server stopped");
    }
}

/// Enqueue one polling request to every registered gateway.
pub(crate) fn broadcast_to_gateways(state: &ServerState, pkt_type: PktType) {
    let payload = Bytes::from(wire::format_header(PktDirection::FromServer, pkt_type));
    let gateways = state.gateway_map.registered();
    debug!("broadcasting {pkt_type:?} to {} gateways", gateways.len());
    for addr in gateways {
        state.enqueue_outbound(addr, payload.clone());
    }
}

fn due(last: Option<Instant>, period: Duration) -> bool {
    match last {
        Some(at) => at.elapsed() >= period,
        None => true,
    }
}

/// The main loop's two timers: request tracked-object data every T_tracked
/// seconds and health reports every T_health seconds. Runs until shutdown.
pub async fn run_periodic_broadcasts(state: Arc<ServerState>) {
    let period_tracked = Duration::from_secs(state.config.polling.period_between_rftod_in_sec);
    let period_health = Duration::from_secs(state.config.polling.period_between_rfhr_in_sec);
    let mut last_tracked: Option<Instant> = None;
    let mut last_health: Option<Instant> = None;

    while state.is_running() {
        if due(last_tracked, period_tracked) {
            broadcast_to_gateways(&state, PktType::TrackedObjectData);
            last_tracked = Some(Instant::now());
        }
        if due(last_health, period_health) {
            broadcast_to_gateways(&state, PktType::GatewayHealthReport);
            last_health = Some(Instant::now());
        }
        sleep(Duration::from_millis(BUSY_WAITING_TIME_IN_MS)).await;
    }
}
