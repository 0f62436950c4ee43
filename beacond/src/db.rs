//! Database collaborator interface.
//!
//! Relational persistence lives outside the packet engine; this trait is
//! the surface the core consumes. Handler code treats every method as
//! fallible and absorbs errors at the handler boundary — a collaborator
//! failure never stops the engine, the in-memory state stays as it was and
//! the next packet retries.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};

/// A pending notification alarm, delivered to gateways as
/// `alarm_type;duration_sec;agents_csv;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub alarm_type: u32,
    pub duration_sec: u32,
    pub agents_csv: String,
}

pub trait Database: Send + Sync {
    /// Record that a gateway (re-)registered.
    fn update_gateway_registration(&self, addr: SocketAddr) -> Result<()>;

    /// Record the beacon list a gateway carried in its join payload. The
    /// payload body is opaque to the core.
    fn update_beacon_registration(&self, gateway: SocketAddr, payload: &str) -> Result<()>;

    fn update_gateway_health(&self, addr: SocketAddr, report: &str) -> Result<()>;

    fn update_beacon_health(&self, addr: SocketAddr, report: &str) -> Result<()>;

    /// Persist one tracked-object report (battery-voltage dialect). When
    /// `panic_monitor` is set the collaborator also flags panic events.
    fn update_object_tracking(&self, report: &str, panic_monitor: bool) -> Result<()>;

    /// A monitored object crossed a fence after a valid perimeter crossing.
    fn identify_geofence_violation(&self, mac: &str) -> Result<()>;

    /// Write the currently active geo-fence settings to `path`, one
    /// `area_id;setting_id;name;perimeters;fences;` line per setting.
    fn dump_active_geofence_settings(&self, path: &Path) -> Result<()>;

    /// Write the monitored-object sets to `path`, one `area_id;mac;` line
    /// per object.
    fn dump_monitored_objects(&self, path: &Path) -> Result<()>;

    /// Fold recent panic / geo-fence events into the notification table.
    fn collect_violation_events(&self, window: Duration, granularity: Duration) -> Result<()>;

    /// Drain the alarms queued for delivery to gateways.
    fn take_pending_alarms(&self) -> Result<Vec<Alarm>>;

    /// Drop data older than the retention window.
    fn vacuum(&self, keep_hours: u32) -> Result<()>;
}

/// In-memory collaborator. Backs the daemon when no external database is
/// wired in, and gives tests something to observe.
#[derive(Default)]
pub struct MemoryDatabase {
    registrations: Mutex<Vec<SocketAddr>>,
    beacon_registrations: Mutex<Vec<(SocketAddr, String)>>,
    gateway_health: Mutex<Vec<(SocketAddr, String)>>,
    beacon_health: Mutex<Vec<(SocketAddr, String)>>,
    tracking_reports: Mutex<Vec<String>>,
    violations: Mutex<Vec<String>>,
    pending_alarms: Mutex<Vec<Alarm>>,
    geofence_settings_csv: Mutex<String>,
    geofence_objects_csv: Mutex<String>,
    vacuum_calls: AtomicU64,
    collect_calls: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the settings the next `dump_active_geofence_settings` writes.
    pub fn set_geofence_settings(&self, csv: &str) {
        *self.geofence_settings_csv.lock().unwrap() = csv.to_string();
    }

    /// Seed the objects the next `dump_monitored_objects` writes.
    pub fn set_geofence_objects(&self, csv: &str) {
        *self.geofence_objects_csv.lock().unwrap() = csv.to_string();
    }

    pub fn push_alarm(&self, alarm: Alarm) {
        self.pending_alarms.lock().unwrap().push(alarm);
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap().clone()
    }

    pub fn tracking_reports(&self) -> Vec<String> {
        self.tracking_reports.lock().unwrap().clone()
    }

    pub fn gateway_health_reports(&self) -> Vec<(SocketAddr, String)> {
        self.gateway_health.lock().unwrap().clone()
    }

    pub fn beacon_health_reports(&self) -> Vec<(SocketAddr, String)> {
        self.beacon_health.lock().unwrap().clone()
    }

    pub fn registrations(&self) -> Vec<SocketAddr> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn vacuum_calls(&self) -> u64 {
        self.vacuum_calls.load(Ordering::Relaxed)
    }

    pub fn collect_calls(&self) -> u64 {
        self.collect_calls.load(Ordering::Relaxed)
    }
}

fn write_dump(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating dump directory {}", parent.display()))?;
        }
    }
    fs::write(path, contents).with_context(|| format!("writing dump file {}", path.display()))
}

impl Database for MemoryDatabase {
    fn update_gateway_registration(&self, addr: SocketAddr) -> Result<()> {
        self.registrations.lock().unwrap().push(addr);
        Ok(())
    }

    fn update_beacon_registration(&self, gateway: SocketAddr, payload: &str) -> Result<()> {
        self.beacon_registrations
            .lock()
            .unwrap()
            .push((gateway, payload.to_string()));
        Ok(())
    }

    fn update_gateway_health(&self, addr: SocketAddr, report: &str) -> Result<()> {
        self.gateway_health
            .lock()
            .unwrap()
            .push((addr, report.to_string()));
        Ok(())
    }

    fn update_beacon_health(&self, addr: SocketAddr, report: &str) -> Result<()> {
        self.beacon_health
            .lock()
            .unwrap()
            .push((addr, report.to_string()));
        Ok(())
    }

    fn update_object_tracking(&self, report: &str, _panic_monitor: bool) -> Result<()> {
        self.tracking_reports
            .lock()
            .unwrap()
            .push(report.to_string());
        Ok(())
    }

    fn identify_geofence_violation(&self, mac: &str) -> Result<()> {
        self.violations.lock().unwrap().push(mac.to_string());
        Ok(())
    }

    fn dump_active_geofence_settings(&self, path: &Path) -> Result<()> {
        write_dump(path, &self.geofence_settings_csv.lock().unwrap())
    }

    fn dump_monitored_objects(&self, path: &Path) -> Result<()> {
        write_dump(path, &self.geofence_objects_csv.lock().unwrap())
    }

    fn collect_violation_events(&self, _window: Duration, _granularity: Duration) -> Result<()> {
        self.collect_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn take_pending_alarms(&self) -> Result<Vec<Alarm>> {
        Ok(std::mem::take(&mut *self.pending_alarms.lock().unwrap()))
    }

    fn vacuum(&self, _keep_hours: u32) -> Result<()> {
        self.vacuum_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_alarms_drain_once() {
        let db = MemoryDatabase::new();
        db.push_alarm(Alarm {
            alarm_type: 2,
            duration_sec: 30,
            agents_csv: "agent-a".into(),
        });
        assert_eq!(db.take_pending_alarms().unwrap().len(), 1);
        assert!(db.take_pending_alarms().unwrap().is_empty());
    }

    #[test]
    fn dump_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = MemoryDatabase::new();
        db.set_geofence_settings("1;5;door;1,0001000000000000000000000000000P,-70;1,0001000000000000000000000000000F,-60;\n");

        let path = dir.path().join("active_geo_fence.csv");
        db.dump_active_geofence_settings(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("1;5;door;"));
    }
}
