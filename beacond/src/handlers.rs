//! Packet handlers, one per buffer-list class.
//!
//! A handler receives one detached buffer node, does bounded work and owns
//! the node's fate. Taking the node out of the pool happens first, so the
//! slot is back on the free list before any collaborator call and no lock
//! is ever held across one. Collaborator failures are logged and absorbed
//! here; the scheduler above never sees an error.

use bytes::Bytes;
use log::{debug, info, warn};

use crate::buffer::{BufNode, HandlerKind};
use crate::geofence::{self, ACTIVE_GEO_FENCE_FILE, GEO_FENCE_OBJECTS_FILE};
use crate::mempool::SlotRef;
use crate::state::ServerState;
use crate::wire::{
    self, API_VERSION_20, GeoFenceReloadKind, PktDirection, PktType, ReloadCommand,
};

/// One job for the worker pool: a detached node, the handler its list is
/// bound to, and the list's nice (carried through for observability).
pub struct WorkOrder {
    pub handler: HandlerKind,
    pub node: SlotRef,
    pub nice: i32,
}

/// Entry point the worker pool runs for every job.
pub fn dispatch(state: &ServerState, order: WorkOrder) {
    let node = match state.node_pool.free(order.node) {
        Ok(node) => node,
        Err(err) => {
            warn!("stale work order, buffer node already gone: {err}");
            return;
        }
    };

    match order.handler {
        HandlerKind::NsiReceive => nsi_receive(state, node),
        HandlerKind::BhmReceive => bhm_receive(state, node),
        HandlerKind::DataReceive => data_receive(state, node),
        HandlerKind::GeoFenceReceive => geofence_receive(state, node),
        HandlerKind::Command => command(state, node),
        HandlerKind::WifiSend => wifi_send(state, node),
    }
}

/// Join requests: register the gateway and queue a join response. Never
/// fails — a denial is carried in the response status.
fn nsi_receive(state: &ServerState, node: BufNode) {
    state.metrics.inc_join_requests();
    debug!("join request from {}", node.addr);

    if let Err(err) = state.db.update_gateway_registration(node.addr) {
        state.metrics.inc_collaborator_errors();
        warn!("gateway registration not persisted: {err:#}");
    }
    if let Err(err) = state.db.update_beacon_registration(node.addr, node.content()) {
        state.metrics.inc_collaborator_errors();
        warn!("beacon registration not persisted: {err:#}");
    }

    let status = state.gateway_map.join(node.addr, node.api_version);
    if status == crate::addr_map::JoinStatus::Deny {
        state.metrics.inc_join_denials();
    }

    let Some(response) = BufNode::new(
        PktDirection::FromServer,
        PktType::JoinResponse,
        node.api_version,
        node.addr,
        &format!("{};", status.code()),
        std::time::Instant::now(),
    ) else {
        return;
    };

    match state.alloc_node_with_retry(response) {
        Some(slot) => {
            if let Err(err) = state.lists.nsi_send.push(&state.node_pool, slot) {
                warn!("failed to queue join response: {err}");
                let _ = state.node_pool.free(slot);
            }
        }
        None => warn!("node pool drained, join response for {} dropped", node.addr),
    }
}

/// Health reports: hand off to the collaborator by packet type.
fn bhm_receive(state: &ServerState, node: BufNode) {
    let result = match node.pkt_type {
        PktType::GatewayHealthReport => state.db.update_gateway_health(node.addr, node.content()),
        PktType::BeaconHealthReport => state.db.update_beacon_health(node.addr, node.content()),
        _ => Ok(()),
    };
    if let Err(err) = result {
        state.metrics.inc_collaborator_errors();
        warn!("health report from {} not persisted: {err:#}", node.addr);
    }
}

/// Tracked-object data from ordinary gateways.
fn data_receive(state: &ServerState, node: BufNode) {
    update_tracking(state, &node);
}

/// Time-critical tracked-object data: geo-fence evaluation first, then the
/// same persistence path as ordinary tracking data.
fn geofence_receive(state: &ServerState, node: BufNode) {
    if state.config.geofence.enabled {
        match wire::parse_tracked_object_report(node.content()) {
            Ok(report) => {
                let outcome = state.geofence.check_violations(&report, node.received_at);
                for _ in 0..outcome.perimeter_hits {
                    state.metrics.inc_perimeter_hits();
                }
                for mac in &outcome.fence_violations {
                    state.metrics.inc_fence_violations();
                    if let Err(err) = state.db.identify_geofence_violation(mac) {
                        state.metrics.inc_collaborator_errors();
                        warn!("fence violation for {mac} not persisted: {err:#}");
                    }
                }
            }
            Err(err) => {
                state.metrics.inc_malformed_dropped();
                debug!("unparseable tracked-object data from {}: {err}", node.addr);
                return;
            }
        }
    }

    update_tracking(state, &node);
}

fn update_tracking(state: &ServerState, node: &BufNode) {
    // 2.0-dialect gateways predate battery voltage reporting; their
    // payloads are not persisted.
    if (node.api_version - API_VERSION_20).abs() < f32::EPSILON {
        debug!("ignoring 2.0-dialect tracking data from {}", node.addr);
        return;
    }
    if let Err(err) = state
        .db
        .update_object_tracking(node.content(), state.config.monitor.panic_button)
    {
        state.metrics.inc_collaborator_errors();
        warn!("tracking data from {} not persisted: {err:#}", node.addr);
    }
}

/// IPC commands from the GUI side.
fn command(state: &ServerState, node: BufNode) {
    match wire::parse_ipc_command(node.content()) {
        Ok(Some(reload)) => reload_geofence_settings(state, reload),
        Ok(None) => debug!("ignoring IPC command [{}]", node.content()),
        Err(err) => debug!("malformed IPC command from {}: {err}", node.addr),
    }
}

/// Ask the collaborator for fresh dumps and swap the in-memory geo-fence
/// state in place. Also runs once at startup to build the initial list.
pub(crate) fn reload_geofence_settings(state: &ServerState, reload: ReloadCommand) {
    let dump_dir = &state.config.geofence.dump_dir;

    if matches!(
        reload.kind,
        GeoFenceReloadKind::All | GeoFenceReloadKind::ListOnly
    ) {
        let path = dump_dir.join(ACTIVE_GEO_FENCE_FILE);
        let loaded = state
            .db
            .dump_active_geofence_settings(&path)
            .and_then(|()| geofence::load_settings_file(&path).map_err(Into::into));
        match loaded {
            Ok(areas) => state.geofence.replace_areas(areas, reload.scope),
            Err(err) => {
                state.metrics.inc_collaborator_errors();
                warn!("geo-fence settings reload failed, keeping current list: {err:#}");
            }
        }
    }

    if matches!(
        reload.kind,
        GeoFenceReloadKind::All | GeoFenceReloadKind::ObjectsOnly
    ) {
        let path = dump_dir.join(GEO_FENCE_OBJECTS_FILE);
        let loaded = state
            .db
            .dump_monitored_objects(&path)
            .and_then(|()| geofence::load_objects_file(&path).map_err(Into::into));
        match loaded {
            Ok(monitored) => state.geofence.replace_monitored(monitored, reload.scope),
            Err(err) => {
                state.metrics.inc_collaborator_errors();
                warn!("geo-fence objects reload failed, keeping current sets: {err:#}");
            }
        }
    }

    info!(
        "geo-fence settings reloaded ({} areas, {} monitored areas)",
        state.geofence.area_count(),
        state.geofence.monitored_area_count()
    );
}

/// Send handler shared by the NSI-send and BHM-send lists: prefix the wire
/// header and hand the datagram to the transport.
fn wifi_send(state: &ServerState, node: BufNode) {
    let payload = format!(
        "{}{}",
        wire::format_header(node.direction, node.pkt_type),
        node.content()
    );
    if state.enqueue_outbound(node.addr, Bytes::from(payload)) {
        debug!(
            "queued {:?} packet for {}",
            node.pkt_type, node.addr
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::MemoryDatabase;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Instant;

    const PERIMETER_UUID: &str = "00010000000000000000000000000050";
    const FENCE_UUID: &str = "00010000000000000000000000000051";
    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn gateway() -> SocketAddr {
        "10.0.0.5:4000".parse().unwrap()
    }

    fn state_with(config: Config) -> (Arc<ServerState>, Arc<MemoryDatabase>) {
        let db = Arc::new(MemoryDatabase::new());
        (ServerState::new(config, db.clone()), db)
    }

    fn received(
        state: &ServerState,
        direction: PktDirection,
        pkt_type: PktType,
        body: &str,
    ) -> SlotRef {
        let node = BufNode::new(direction, pkt_type, 2.2, gateway(), body, Instant::now()).unwrap();
        state.node_pool.alloc(node).unwrap()
    }

    #[test]
    fn join_request_registers_and_responds() {
        let (state, db) = state_with(Config::default());
        let node = received(&state, PktDirection::FromGateway, PktType::RequestToJoin, "");

        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::NsiReceive,
                node,
                nice: 0,
            },
        );

        assert!(state.gateway_map.contains(gateway()));
        assert_eq!(db.registrations(), vec![gateway()]);
        assert_eq!(state.lists.nsi_send.len(), 1);

        // Run the send handler on the queued response.
        let response = state.lists.nsi_send.pop(&state.node_pool).unwrap().unwrap();
        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::WifiSend,
                node: response,
                nice: 0,
            },
        );

        let pkt = state.outbound.dequeue().unwrap();
        assert_eq!(pkt.addr, gateway());
        assert_eq!(pkt.payload.as_ref(), b"2;2;2.2;0;");
        // Every node went back to the pool.
        assert_eq!(state.node_pool.allocated(), 0);
    }

    #[test]
    fn health_reports_reach_the_collaborator() {
        let (state, db) = state_with(Config::default());

        let node = received(
            &state,
            PktDirection::FromGateway,
            PktType::GatewayHealthReport,
            "0;85;",
        );
        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::BhmReceive,
                node,
                nice: 0,
            },
        );

        let node = received(
            &state,
            PktDirection::FromGateway,
            PktType::BeaconHealthReport,
            "uuid;0;91;",
        );
        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::BhmReceive,
                node,
                nice: 0,
            },
        );

        assert_eq!(db.gateway_health_reports(), vec![(gateway(), "0;85;".to_string())]);
        assert_eq!(db.beacon_health_reports(), vec![(gateway(), "uuid;0;91;".to_string())]);
    }

    #[test]
    fn tracking_data_persisted_except_old_dialect() {
        let (state, db) = state_with(Config::default());
        let body = format!("{PERIMETER_UUID};now;ip;0;0;1;0;");

        let node = received(
            &state,
            PktDirection::FromGateway,
            PktType::TrackedObjectData,
            &body,
        );
        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::DataReceive,
                node,
                nice: 0,
            },
        );
        assert_eq!(db.tracking_reports().len(), 1);

        let old = BufNode::new(
            PktDirection::FromGateway,
            PktType::TrackedObjectData,
            2.0,
            gateway(),
            &body,
            Instant::now(),
        )
        .unwrap();
        let node = state.node_pool.alloc(old).unwrap();
        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::DataReceive,
                node,
                nice: 0,
            },
        );
        assert_eq!(db.tracking_reports().len(), 1);
    }

    #[test]
    fn time_critical_data_runs_geofence_then_persists() {
        let mut config = Config::default();
        config.geofence.perimeter_valid_duration_in_sec = 10;
        let (state, db) = state_with(config);

        state.geofence.replace_areas(
            geofence::parse_settings_csv(&format!(
                "1;5;dock;1,{PERIMETER_UUID},-70;1,{FENCE_UUID},-60;\n"
            )),
            wire::AreaScope::All,
        );
        state.geofence.replace_monitored(
            geofence::parse_objects_csv(&format!("1;{MAC};\n")),
            wire::AreaScope::All,
        );

        let perimeter_body =
            format!("{PERIMETER_UUID};now;ip;0;1;{MAC};1;2;-65;0;3.0;1;0;");
        let node = received(
            &state,
            PktDirection::FromGateway,
            PktType::TimeCriticalTrackedObjectData,
            &perimeter_body,
        );
        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::GeoFenceReceive,
                node,
                nice: 0,
            },
        );
        assert!(db.violations().is_empty());

        let fence_body = format!("{FENCE_UUID};now;ip;0;1;{MAC};1;2;-55;0;3.0;1;0;");
        let node = received(
            &state,
            PktDirection::FromGateway,
            PktType::TimeCriticalTrackedObjectData,
            &fence_body,
        );
        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::GeoFenceReceive,
                node,
                nice: 0,
            },
        );

        assert_eq!(db.violations(), vec![MAC.to_string()]);
        assert_eq!(db.tracking_reports().len(), 2);
        assert_eq!(state.metrics.fence_violations(), 1);
    }

    #[test]
    fn reload_command_swaps_geofence_state() {
        let dump_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.geofence.dump_dir = dump_dir.path().to_path_buf();
        let (state, db) = state_with(config);

        db.set_geofence_settings(&format!(
            "1;5;dock;1,{PERIMETER_UUID},-70;1,{FENCE_UUID},-60;\n"
        ));
        db.set_geofence_objects(&format!("1;{MAC};\n"));
        assert_eq!(state.geofence.area_count(), 0);

        let node = received(&state, PktDirection::FromGui, PktType::IpcCommand, "1;1;1;");
        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::Command,
                node,
                nice: 0,
            },
        );

        assert_eq!(state.geofence.area_count(), 1);
        assert_eq!(state.geofence.monitored_area_count(), 1);
    }

    #[test]
    fn full_map_sends_deny_response() {
        let (state, _db) = state_with(Config::default());
        // Exhaust the map with other gateways first.
        for n in 0..crate::addr_map::MAX_NUMBER_NODES {
            let filler: SocketAddr = format!("10.1.{}.{}:4000", n / 256, n % 256).parse().unwrap();
            state.gateway_map.join(filler, 2.2);
        }

        let node = received(&state, PktDirection::FromGateway, PktType::RequestToJoin, "");
        dispatch(
            &state,
            WorkOrder {
                handler: HandlerKind::NsiReceive,
                node,
                nice: 0,
            },
        );

        let response = state.lists.nsi_send.pop(&state.node_pool).unwrap().unwrap();
        let content = state
            .node_pool
            .with(response, |n| n.content().to_string())
            .unwrap();
        assert_eq!(content, "1;");
        assert_eq!(state.metrics.join_denials(), 1);
        let _ = state.node_pool.free(response);
    }
}
