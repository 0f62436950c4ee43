//! Priority-list dispatcher.
//!
//! One dedicated thread repeatedly selects the highest-priority non-empty
//! buffer list, detaches its head node and submits it to the worker pool.
//! When the starvation timer expires, time-critical lists get one more
//! serving and then the scan runs in reverse so every list makes progress
//! in bounded time. A node that outlived the out-of-date threshold is freed
//! here instead of being submitted — the engine's only back-pressure
//! mechanism.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::buffer::BufferList;
use crate::handlers::{self, WorkOrder};
use crate::state::{BUSY_WAITING_TIME_IN_MS, PRIORITY_IDLE_SLEEP_MS, ServerState};
use crate::thpool::ThreadPool;

/// Detach the head of `list` as a work order. A node past the out-of-date
/// threshold is freed on the spot and `None` is returned, as for an empty
/// list.
fn detach_head(state: &ServerState, list: &BufferList) -> Option<WorkOrder> {
    let node = match list.pop(&state.node_pool) {
        Ok(Some(node)) => node,
        Ok(None) => return None,
        Err(err) => {
            error!("buffer list {} lost a node: {err}", list.name);
            return None;
        }
    };

    let max_age = Duration::from_secs(state.config.engine.min_age_out_of_date_packet_in_sec);
    let stale = state
        .node_pool
        .with(node, |n| n.received_at.elapsed() > max_age)
        .unwrap_or(true);
    if stale {
        let _ = state.node_pool.free(node);
        state.metrics.inc_stale_dropped();
        debug!("dropped out-of-date packet from {}", list.name);
        return None;
    }

    Some(WorkOrder {
        handler: list.handler,
        node,
        nice: list.nice,
    })
}

/// Forward scan: the first detachable head, walking high to low priority.
pub fn select_next(state: &ServerState) -> Option<WorkOrder> {
    for list in state.lists.priority.iter() {
        if let Some(order) = detach_head(state, list) {
            return Some(order);
        }
    }
    None
}

/// Starvation handling: serve every time-critical list once more (they stay
/// privileged), then walk the whole priority list in reverse, taking at
/// most one head from each non-empty list.
pub fn starvation_pass(state: &ServerState) -> Vec<WorkOrder> {
    let mut orders = Vec::new();
    let time_critical = state.levels().time_critical;

    for list in state.lists.priority.iter() {
        if list.nice != time_critical {
            break;
        }
        if let Some(order) = detach_head(state, list) {
            orders.push(order);
        }
    }

    for list in state.lists.priority.iter().rev() {
        if let Some(order) = detach_head(state, list) {
            orders.push(order);
        }
    }
    orders
}

/// Dispatcher thread body. Owns the worker pool for its whole life.
pub fn run_dispatcher(state: Arc<ServerState>) {
    // Wait until the transport is up before accepting work.
    while !state.transport_ready() {
        if state.failed() || !state.is_running() {
            return;
        }
        thread::sleep(Duration::from_millis(BUSY_WAITING_TIME_IN_MS));
    }

    let runner_state = Arc::clone(&state);
    let pool = match ThreadPool::new(
        state.config.engine.worker_threads,
        move |order: WorkOrder| {
            handlers::dispatch(&runner_state, order);
        },
    ) {
        Ok(pool) => pool,
        Err(err) => {
            error!("failed to start worker pool: {err}");
            state.mark_failed();
            return;
        }
    };

    info!(
        "dispatcher running with {} worker threads",
        state.config.engine.worker_threads
    );
    state.set_dispatcher_ready();

    let max_starvation = Duration::from_secs(state.config.engine.max_starvation_time_in_sec);
    let mut timer_start = Instant::now();

    while state.is_running() {
        // Phase 1: high-to-low scan, bounded by the starvation timer.
        while state.is_running() && timer_start.elapsed() < max_starvation {
            match select_next(&state) {
                Some(order) => {
                    let nice = order.nice;
                    pool.add_work(order, nice);
                }
                None => thread::sleep(Duration::from_millis(PRIORITY_IDLE_SLEEP_MS)),
            }
        }
        if !state.is_running() {
            break;
        }

        // Phase 2: reverse service, then reset the timer.
        for order in starvation_pass(&state) {
            let nice = order.nice;
            pool.add_work(order, nice);
        }
        timer_start = Instant::now();
    }

    pool.shutdown();
    info!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufNode, HandlerKind};
    use crate::config::Config;
    use crate::db::MemoryDatabase;
    use crate::wire::{PktDirection, PktType};
    use std::net::SocketAddr;

    fn gateway() -> SocketAddr {
        "10.0.0.5:4000".parse().unwrap()
    }

    fn test_state(config: Config) -> Arc<ServerState> {
        ServerState::new(config, Arc::new(MemoryDatabase::new()))
    }

    fn push_node(state: &ServerState, list: &BufferList, pkt_type: PktType, age: Duration) {
        let node = BufNode::new(
            PktDirection::FromGateway,
            pkt_type,
            2.2,
            gateway(),
            "body;",
            Instant::now() - age,
        )
        .unwrap();
        let slot = state.node_pool.alloc(node).unwrap();
        list.push(&state.node_pool, slot).unwrap();
    }

    #[test]
    fn time_critical_list_is_served_first() {
        let state = test_state(Config::default());
        push_node(
            &state,
            &state.lists.data_receive,
            PktType::TrackedObjectData,
            Duration::ZERO,
        );
        push_node(
            &state,
            &state.lists.bhm_receive,
            PktType::GatewayHealthReport,
            Duration::ZERO,
        );
        push_node(
            &state,
            &state.lists.geofence_receive,
            PktType::TimeCriticalTrackedObjectData,
            Duration::ZERO,
        );

        let order = select_next(&state).unwrap();
        assert_eq!(order.handler, HandlerKind::GeoFenceReceive);
        assert_eq!(order.nice, state.levels().time_critical);
        let _ = state.node_pool.free(order.node);

        let order = select_next(&state).unwrap();
        assert_eq!(order.handler, HandlerKind::DataReceive);
        let _ = state.node_pool.free(order.node);

        let order = select_next(&state).unwrap();
        assert_eq!(order.handler, HandlerKind::BhmReceive);
        let _ = state.node_pool.free(order.node);

        assert!(select_next(&state).is_none());
    }

    #[test]
    fn out_of_date_node_is_freed_without_dispatch() {
        let mut config = Config::default();
        config.engine.min_age_out_of_date_packet_in_sec = 2;
        let state = test_state(config);

        push_node(
            &state,
            &state.lists.data_receive,
            PktType::TrackedObjectData,
            Duration::from_secs(10),
        );

        assert!(select_next(&state).is_none());
        assert_eq!(state.metrics.stale_dropped(), 1);
        assert_eq!(state.node_pool.allocated(), 0);
        assert!(state.lists.data_receive.is_empty());
    }

    #[test]
    fn starvation_pass_serves_low_priority_and_keeps_tc_privileged() {
        let state = test_state(Config::default());
        push_node(
            &state,
            &state.lists.geofence_receive,
            PktType::TimeCriticalTrackedObjectData,
            Duration::ZERO,
        );
        push_node(
            &state,
            &state.lists.geofence_receive,
            PktType::TimeCriticalTrackedObjectData,
            Duration::ZERO,
        );
        push_node(
            &state,
            &state.lists.bhm_receive,
            PktType::GatewayHealthReport,
            Duration::ZERO,
        );
        push_node(
            &state,
            &state.lists.data_receive,
            PktType::TrackedObjectData,
            Duration::ZERO,
        );

        let orders = starvation_pass(&state);
        let kinds: Vec<_> = orders.iter().map(|o| o.handler).collect();

        // Time-critical first, then the reverse walk reaches the low and
        // normal lists, and the second time-critical node last.
        assert_eq!(
            kinds,
            vec![
                HandlerKind::GeoFenceReceive,
                HandlerKind::BhmReceive,
                HandlerKind::DataReceive,
                HandlerKind::GeoFenceReceive,
            ]
        );
        for order in orders {
            let _ = state.node_pool.free(order.node);
        }
    }

    #[test]
    fn low_priority_list_progresses_under_time_critical_load() {
        let mut config = Config::default();
        config.engine.max_starvation_time_in_sec = 1;
        config.engine.worker_threads = 2;
        config.geofence.enabled = false;
        let state = test_state(config);
        state.set_transport_ready();

        let dispatcher = {
            let state = Arc::clone(&state);
            thread::spawn(move || run_dispatcher(state))
        };
        // Continuous stream of time-critical nodes.
        let feeder = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                while state.is_running() {
                    push_node(
                        &state,
                        &state.lists.geofence_receive,
                        PktType::TimeCriticalTrackedObjectData,
                        Duration::ZERO,
                    );
                    thread::sleep(Duration::from_millis(10));
                }
            })
        };

        push_node(
            &state,
            &state.lists.bhm_receive,
            PktType::GatewayHealthReport,
            Duration::ZERO,
        );

        // The starvation pass must reach the low-priority list within the
        // one-second budget (plus scheduling slack).
        let deadline = Instant::now() + Duration::from_secs(3);
        while state.lists.bhm_receive.len() > 0 {
            assert!(
                Instant::now() < deadline,
                "low-priority node starved past the starvation budget"
            );
            thread::sleep(Duration::from_millis(20));
        }

        state.shutdown();
        feeder.join().unwrap();
        dispatcher.join().unwrap();
    }

    #[test]
    fn dispatcher_drives_join_to_response() {
        let state = test_state(Config::default());
        state.set_transport_ready();
        let dispatcher = {
            let state = Arc::clone(&state);
            thread::spawn(move || run_dispatcher(state))
        };

        push_node(
            &state,
            &state.lists.nsi_receive,
            PktType::RequestToJoin,
            Duration::ZERO,
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let pkt = loop {
            if let Some(pkt) = state.outbound.dequeue() {
                break pkt;
            }
            assert!(Instant::now() < deadline, "no join response emitted");
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(pkt.addr, gateway());
        assert_eq!(pkt.payload.as_ref(), b"2;2;2.2;0;");

        state.shutdown();
        dispatcher.join().unwrap();
        assert_eq!(state.node_pool.allocated(), 0);
    }
}
