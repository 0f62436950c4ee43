//! Auxiliary worker loops.
//!
//! Each is a periodic task beside the packet engine: registry expiry
//! sweeps, database retention maintenance, violation-event collection and
//! notification-alarm dispatch. They talk to the engine only through the
//! same contracts the handlers use — the collaborator trait and the
//! outbound queue.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::time::sleep;

use crate::state::ServerState;
use crate::wire::{self, PktDirection, PktType};

/// Spawn every auxiliary loop that the configuration enables.
pub fn spawn_all(state: &Arc<ServerState>) {
    tokio::spawn(sweep_loop(Arc::clone(state)));
    tokio::spawn(database_maintenance_loop(Arc::clone(state)));
    if state.config.monitor.collect_violation_event {
        tokio::spawn(collect_violations_loop(Arc::clone(state)));
    }
    if state.config.monitor.send_notification_alarm {
        tokio::spawn(notification_loop(Arc::clone(state)));
    }
}

/// Release gateways that stopped reporting and drop expired perimeter
/// records.
async fn sweep_loop(state: Arc<ServerState>) {
    let period = Duration::from_secs(state.config.registry.sweep_period_in_sec);
    while state.is_running() {
        sleep(period).await;
        sweep_once(&state);
    }
}

pub(crate) fn sweep_once(state: &ServerState) {
    let tolerance = Duration::from_secs(state.config.registry.address_map_tolerance_in_sec);
    let released = state.gateway_map.sweep(tolerance);
    if !released.is_empty() {
        info!("released {} silent gateways", released.len());
    }
    state.geofence.sweep_violations();
}

/// Periodic retention vacuum on the collaborator.
async fn database_maintenance_loop(state: Arc<ServerState>) {
    let period = Duration::from_secs(state.config.database.maintenance_period_in_sec);
    while state.is_running() {
        sleep(period).await;
        if let Err(err) = state.db.vacuum(state.config.database.keep_hours) {
            state.metrics.inc_collaborator_errors();
            warn!("database maintenance failed: {err:#}");
        }
    }
}

/// Fold recent panic / geo-fence events into the collaborator's
/// notification table.
async fn collect_violations_loop(state: Arc<ServerState>) {
    let period = Duration::from_secs(state.config.monitor.collect_violation_interval_in_sec);
    let granularity = Duration::from_secs(
        state
            .config
            .monitor
            .granularity_for_continuous_violations_in_sec,
    );
    while state.is_running() {
        sleep(period).await;
        if let Err(err) = state.db.collect_violation_events(period, granularity) {
            state.metrics.inc_collaborator_errors();
            warn!("violation collection failed: {err:#}");
        }
    }
}

/// Drain pending alarms and fan them out to the gateway fleet.
async fn notification_loop(state: Arc<ServerState>) {
    let period = Duration::from_secs(state.config.monitor.notification_period_in_sec);
    while state.is_running() {
        sleep(period).await;
        dispatch_pending_alarms(&state);
    }
}

pub(crate) fn dispatch_pending_alarms(state: &ServerState) {
    let alarms = match state.db.take_pending_alarms() {
        Ok(alarms) => alarms,
        Err(err) => {
            state.metrics.inc_collaborator_errors();
            warn!("failed to fetch pending alarms: {err:#}");
            return;
        }
    };

    for alarm in alarms {
        let payload = format!(
            "{}{}",
            wire::format_header(PktDirection::FromServer, PktType::NotificationAlarm),
            wire::notification_alarm_body(alarm.alarm_type, alarm.duration_sec, &alarm.agents_csv),
        );
        let payload = Bytes::from(payload);
        let gateways = state.gateway_map.registered();
        debug!("sending notification alarm to {} gateways", gateways.len());
        for addr in gateways {
            state.enqueue_outbound(addr, payload.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{Alarm, MemoryDatabase};
    use std::net::SocketAddr;

    fn gateway(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:4000").parse().unwrap()
    }

    #[test]
    fn pending_alarms_reach_every_gateway() {
        let db = Arc::new(MemoryDatabase::new());
        let state = ServerState::new(Config::default(), db.clone());
        state.gateway_map.join(gateway(1), 2.2);
        state.gateway_map.join(gateway(2), 2.2);

        db.push_alarm(Alarm {
            alarm_type: 2,
            duration_sec: 30,
            agents_csv: "agent-a,agent-b".into(),
        });

        dispatch_pending_alarms(&state);

        let mut count = 0;
        while let Some(pkt) = state.outbound.dequeue() {
            assert_eq!(pkt.payload.as_ref(), b"2;7;2.2;2;30;agent-a,agent-b;");
            count += 1;
        }
        assert_eq!(count, 2);

        // Alarms are delivered once.
        dispatch_pending_alarms(&state);
        assert!(state.outbound.is_empty());
    }

    #[test]
    fn sweep_once_releases_expired_entries() {
        let mut config = Config::default();
        config.registry.address_map_tolerance_in_sec = 0;
        let state = ServerState::new(config, Arc::new(MemoryDatabase::new()));
        state.gateway_map.join(gateway(1), 2.2);

        std::thread::sleep(Duration::from_millis(20));
        sweep_once(&state);
        assert!(state.gateway_map.is_empty());
    }
}
