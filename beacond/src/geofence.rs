//! Geo-fence evaluation.
//!
//! Every monitored area carries fence settings: a set of perimeter beacons
//! and a set of fence beacons, each with an RSSI threshold. A monitored
//! object must cross a perimeter before a fence hit counts — a fence
//! sighting with no recent perimeter crossing is stray RSSI and is ignored.
//! Perimeter crossings are short-lived records, swept once they outlive
//! `perimeter_valid_duration`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::wire::{self, AreaScope, TrackedObjectReport};

/// Settings dump written by the database collaborator.
pub const ACTIVE_GEO_FENCE_FILE: &str = "active_geo_fence.csv";

/// Monitored-objects dump written by the database collaborator.
pub const GEO_FENCE_OBJECTS_FILE: &str = "geo_fence_objects.csv";

/// One cordon of a fence setting: its beacons and the RSSI threshold at
/// which a sighting counts as a crossing.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconSet {
    uuids: Vec<String>,
    pub rssi_threshold: i32,
}

impl BeaconSet {
    /// Parse the dump grammar `count,uuid1,…,uuidN,threshold`.
    pub fn parse(field: &str) -> Option<Self> {
        let mut parts = field.split(',');
        let count: usize = parts.next()?.trim().parse().ok()?;
        let mut uuids = Vec::with_capacity(count);
        for _ in 0..count {
            let uuid = parts.next()?.trim();
            if uuid.is_empty() {
                return None;
            }
            uuids.push(uuid.to_string());
        }
        let rssi_threshold = parts.next()?.trim().parse().ok()?;
        Some(Self {
            uuids,
            rssi_threshold,
        })
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.uuids.iter().any(|u| u == uuid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FenceSetting {
    pub id: i32,
    pub name: String,
    pub perimeters: BeaconSet,
    pub fences: BeaconSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoFenceArea {
    pub area_id: u32,
    pub settings: Vec<FenceSetting>,
}

/// MAC addresses subject to enforcement, per area.
pub type MonitoredObjects = HashMap<u32, HashSet<String>>;

struct ViolationRecord {
    mac: String,
    perimeter_at: Instant,
}

/// What one tracked-object packet did to the violation state.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ViolationOutcome {
    pub perimeter_hits: usize,
    /// MACs whose fence crossing was confirmed; the caller reports these to
    /// the database collaborator once all locks are released.
    pub fence_violations: Vec<String>,
}

enum BeaconRole {
    Perimeter,
    Fence,
}

pub struct GeoFence {
    perimeter_valid: Duration,
    areas: Mutex<Vec<GeoFenceArea>>,
    monitored: Mutex<MonitoredObjects>,
    violations: Mutex<Vec<ViolationRecord>>,
}

impl GeoFence {
    pub fn new(perimeter_valid: Duration) -> Self {
        Self {
            perimeter_valid,
            areas: Mutex::new(Vec::new()),
            monitored: Mutex::new(HashMap::new()),
            violations: Mutex::new(Vec::new()),
        }
    }

    /// Evaluate one tracked-object report received at `now`.
    pub fn check_violations(&self, report: &TrackedObjectReport, now: Instant) -> ViolationOutcome {
        let mut outcome = ViolationOutcome::default();
        let Some(area_id) = wire::area_id_of(&report.beacon_uuid) else {
            return outcome;
        };

        let areas = self.areas.lock().unwrap();
        for area in areas.iter().filter(|a| a.area_id == area_id) {
            for setting in &area.settings {
                if setting.perimeters.contains(&report.beacon_uuid) {
                    self.examine(
                        report,
                        area_id,
                        BeaconRole::Perimeter,
                        setting.perimeters.rssi_threshold,
                        now,
                        &mut outcome,
                    );
                }
                if setting.fences.contains(&report.beacon_uuid) {
                    self.examine(
                        report,
                        area_id,
                        BeaconRole::Fence,
                        setting.fences.rssi_threshold,
                        now,
                        &mut outcome,
                    );
                }
            }
        }
        outcome
    }

    fn examine(
        &self,
        report: &TrackedObjectReport,
        area_id: u32,
        role: BeaconRole,
        rssi_threshold: i32,
        now: Instant,
        outcome: &mut ViolationOutcome,
    ) {
        let monitored = self.monitored.lock().unwrap();
        let Some(watched) = monitored.get(&area_id) else {
            return;
        };

        for object in &report.objects {
            if !watched.contains(&object.mac) {
                continue;
            }
            if object.rssi < rssi_threshold {
                continue;
            }

            let mut violations = self.violations.lock().unwrap();
            Self::sweep_locked(&mut violations, self.perimeter_valid, now);

            match role {
                BeaconRole::Perimeter => {
                    match violations.iter_mut().find(|r| r.mac == object.mac) {
                        Some(record) => record.perimeter_at = now,
                        None => violations.push(ViolationRecord {
                            mac: object.mac.clone(),
                            perimeter_at: now,
                        }),
                    }
                    outcome.perimeter_hits += 1;
                    info!(
                        "perimeter violation: mac [{}] area [{}]",
                        object.mac, area_id
                    );
                }
                BeaconRole::Fence => {
                    // Only a fence hit preceded by a still-valid perimeter
                    // crossing counts; the sweep above already dropped
                    // anything older.
                    if let Some(pos) = violations.iter().position(|r| r.mac == object.mac) {
                        violations.remove(pos);
                        info!("fence violation: mac [{}] area [{}]", object.mac, area_id);
                        outcome.fence_violations.push(object.mac.clone());
                    }
                }
            }
        }
    }

    fn sweep_locked(violations: &mut Vec<ViolationRecord>, valid: Duration, now: Instant) {
        violations.retain(|record| now.duration_since(record.perimeter_at) < valid);
    }

    /// Drop expired perimeter records.
    pub fn sweep_violations(&self) {
        let mut violations = self.violations.lock().unwrap();
        Self::sweep_locked(&mut violations, self.perimeter_valid, Instant::now());
    }

    pub fn pending_violation_count(&self) -> usize {
        self.violations.lock().unwrap().len()
    }

    /// Swap in freshly loaded areas. A scoped replace touches only the
    /// named area and leaves the rest in place.
    pub fn replace_areas(&self, fresh: Vec<GeoFenceArea>, scope: AreaScope) {
        let mut areas = self.areas.lock().unwrap();
        match scope {
            AreaScope::All => *areas = fresh,
            AreaScope::One(area_id) => {
                areas.retain(|a| a.area_id != area_id);
                areas.extend(fresh.into_iter().filter(|a| a.area_id == area_id));
            }
        }
    }

    /// Swap in freshly loaded monitored-object sets, honoring `scope` like
    /// [`GeoFence::replace_areas`].
    pub fn replace_monitored(&self, fresh: MonitoredObjects, scope: AreaScope) {
        let mut monitored = self.monitored.lock().unwrap();
        match scope {
            AreaScope::All => *monitored = fresh,
            AreaScope::One(area_id) => {
                monitored.remove(&area_id);
                if let Some(set) = fresh.get(&area_id) {
                    monitored.insert(area_id, set.clone());
                }
            }
        }
    }

    pub fn area_count(&self) -> usize {
        self.areas.lock().unwrap().len()
    }

    pub fn monitored_area_count(&self) -> usize {
        self.monitored.lock().unwrap().len()
    }
}

/// Parse the settings dump: `area_id;setting_id;name;perimeters;fences;`
/// per line, settings grouped into their areas. Malformed lines are logged
/// and skipped.
pub fn parse_settings_csv(contents: &str) -> Vec<GeoFenceArea> {
    let mut areas: Vec<GeoFenceArea> = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(';');
        let parsed = (|| {
            let area_id: u32 = fields.next()?.trim().parse().ok()?;
            let id: i32 = fields.next()?.trim().parse().ok()?;
            let name = fields.next()?.trim().to_string();
            let perimeters = BeaconSet::parse(fields.next()?)?;
            let fences = BeaconSet::parse(fields.next()?)?;
            Some((
                area_id,
                FenceSetting {
                    id,
                    name,
                    perimeters,
                    fences,
                },
            ))
        })();

        let Some((area_id, setting)) = parsed else {
            warn!("skipping malformed geo-fence setting line [{line}]");
            continue;
        };

        match areas.iter_mut().find(|a| a.area_id == area_id) {
            Some(area) => area.settings.push(setting),
            None => areas.push(GeoFenceArea {
                area_id,
                settings: vec![setting],
            }),
        }
    }
    areas
}

/// Parse the monitored-objects dump: `area_id;mac;` per line.
pub fn parse_objects_csv(contents: &str) -> MonitoredObjects {
    let mut monitored = MonitoredObjects::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(';');
        let area_id = fields.next().and_then(|f| f.trim().parse::<u32>().ok());
        let mac = fields.next().map(|f| f.trim().to_ascii_lowercase());
        match (area_id, mac) {
            (Some(area_id), Some(mac)) if !mac.is_empty() => {
                monitored.entry(area_id).or_default().insert(mac);
            }
            _ => warn!("skipping malformed geo-fence object line [{line}]"),
        }
    }
    monitored
}

pub fn load_settings_file(path: &Path) -> io::Result<Vec<GeoFenceArea>> {
    Ok(parse_settings_csv(&fs::read_to_string(path)?))
}

pub fn load_objects_file(path: &Path) -> io::Result<MonitoredObjects> {
    Ok(parse_objects_csv(&fs::read_to_string(path)?))
}
