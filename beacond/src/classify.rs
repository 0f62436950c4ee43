//! Receive-side classifier.
//!
//! A single thread pulls datagrams off the inbound queue, parses the wire
//! header, wraps the remainder in a pooled buffer node and routes it by
//! (direction, type) to exactly one buffer list. Malformed headers drop the
//! datagram silently; unroutable combinations drop the node.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::buffer::{BufNode, BufferList};
use crate::pkt_queue::Packet;
use crate::state::{RECEIVE_POLL_SLEEP_MS, ServerState};
use crate::wire::{self, PktDirection, PktType};

/// One buffer list per packet class; everything else is unroutable.
fn route<'a>(
    state: &'a ServerState,
    direction: PktDirection,
    pkt_type: PktType,
) -> Option<&'a Arc<BufferList>> {
    match (direction, pkt_type) {
        (PktDirection::FromGateway, PktType::RequestToJoin) => Some(&state.lists.nsi_receive),
        (PktDirection::FromGateway, PktType::TimeCriticalTrackedObjectData) => {
            Some(&state.lists.geofence_receive)
        }
        (PktDirection::FromGateway, PktType::TrackedObjectData) => Some(&state.lists.data_receive),
        (PktDirection::FromGateway, PktType::GatewayHealthReport)
        | (PktDirection::FromGateway, PktType::BeaconHealthReport) => {
            Some(&state.lists.bhm_receive)
        }
        (PktDirection::FromGui, PktType::IpcCommand) => Some(&state.lists.command),
        _ => None,
    }
}

/// Classify one datagram.
pub(crate) fn classify_one(state: &ServerState, pkt: Packet) {
    state.metrics.inc_packets_received();
    let received_at = Instant::now();

    let (header, body) = match wire::parse_header(&pkt.payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            state.metrics.inc_malformed_dropped();
            debug!("dropping malformed datagram from {}: {err}", pkt.addr);
            return;
        }
    };

    // Any packet from a registered gateway refreshes its liveness.
    state.gateway_map.refresh(pkt.addr);

    let Some(list) = route(state, header.direction, header.pkt_type) else {
        state.metrics.inc_unroutable_dropped();
        debug!(
            "dropping unroutable packet ({:?}, {:?}) from {}",
            header.direction, header.pkt_type, pkt.addr
        );
        return;
    };

    let Some(node) = BufNode::new(
        header.direction,
        header.pkt_type,
        header.api_version,
        pkt.addr,
        body,
        received_at,
    ) else {
        state.metrics.inc_malformed_dropped();
        return;
    };

    let Some(slot) = state.alloc_node_with_retry(node) else {
        warn!(
            "node pool exhausted, dropping {:?} from {}",
            header.pkt_type, pkt.addr
        );
        return;
    };

    match list.push(&state.node_pool, slot) {
        Ok(()) => debug!(
            "routed {:?} from {} to {}",
            header.pkt_type, pkt.addr, list.name
        ),
        Err(err) => {
            warn!("failed to insert node into {}: {err}", list.name);
            let _ = state.node_pool.free(slot);
        }
    }
}

/// Classifier thread body.
pub fn run_classifier(state: Arc<ServerState>) {
    while state.is_running() {
        match state.inbound.dequeue() {
            Some(pkt) => classify_one(&state, pkt),
            None => thread::sleep(Duration::from_millis(RECEIVE_POLL_SLEEP_MS)),
        }
    }
}
