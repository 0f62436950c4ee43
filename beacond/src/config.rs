use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/etc/beacond/beacond.toml";
const ENV_CONFIG_PATH: &str = "BEACOND_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub geofence: GeoFenceConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `BEACOND_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    /// Load an explicitly named config file. Unlike [`Config::load`] this
    /// fails loudly: a path the operator typed should not silently fall
    /// back to defaults.
    pub fn load_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port gateways send to.
    #[serde(default = "default_recv_port")]
    pub recv_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            recv_port: default_recv_port(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_recv_port() -> u16 {
    8888
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_node_pool_slots")]
    pub node_pool_slots: usize,
    /// Wall-clock budget after which the dispatcher reverses its scan to
    /// service the low-priority lists.
    #[serde(default = "default_max_starvation_time_in_sec")]
    pub max_starvation_time_in_sec: u64,
    /// Packets older than this on detach are dropped instead of handled.
    #[serde(default = "default_min_age_out_of_date_packet_in_sec")]
    pub min_age_out_of_date_packet_in_sec: u64,
    #[serde(default = "default_time_critical_priority")]
    pub time_critical_priority: i32,
    #[serde(default = "default_high_priority")]
    pub high_priority: i32,
    #[serde(default = "default_normal_priority")]
    pub normal_priority: i32,
    #[serde(default = "default_low_priority")]
    pub low_priority: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            node_pool_slots: default_node_pool_slots(),
            max_starvation_time_in_sec: default_max_starvation_time_in_sec(),
            min_age_out_of_date_packet_in_sec: default_min_age_out_of_date_packet_in_sec(),
            time_critical_priority: default_time_critical_priority(),
            high_priority: default_high_priority(),
            normal_priority: default_normal_priority(),
            low_priority: default_low_priority(),
        }
    }
}

fn default_worker_threads() -> usize {
    8
}
fn default_node_pool_slots() -> usize {
    2048
}
fn default_max_starvation_time_in_sec() -> u64 {
    600
}
fn default_min_age_out_of_date_packet_in_sec() -> u64 {
    10
}
fn default_time_critical_priority() -> i32 {
    -20
}
fn default_high_priority() -> i32 {
    -13
}
fn default_normal_priority() -> i32 {
    0
}
fn default_low_priority() -> i32 {
    13
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    /// Seconds between request-for-tracked-object-data broadcasts.
    #[serde(default = "default_period_between_rftod_in_sec")]
    pub period_between_rftod_in_sec: u64,
    /// Seconds between request-for-health-report broadcasts.
    #[serde(default = "default_period_between_rfhr_in_sec")]
    pub period_between_rfhr_in_sec: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            period_between_rftod_in_sec: default_period_between_rftod_in_sec(),
            period_between_rfhr_in_sec: default_period_between_rfhr_in_sec(),
        }
    }
}

fn default_period_between_rftod_in_sec() -> u64 {
    10
}
fn default_period_between_rfhr_in_sec() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// A gateway silent for longer than this is released from the map.
    #[serde(default = "default_address_map_tolerance_in_sec")]
    pub address_map_tolerance_in_sec: u64,
    #[serde(default = "default_sweep_period_in_sec")]
    pub sweep_period_in_sec: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address_map_tolerance_in_sec: default_address_map_tolerance_in_sec(),
            sweep_period_in_sec: default_sweep_period_in_sec(),
        }
    }
}

fn default_address_map_tolerance_in_sec() -> u64 {
    120
}
fn default_sweep_period_in_sec() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeoFenceConfig {
    #[serde(default = "default_geofence_enabled")]
    pub enabled: bool,
    /// How long a perimeter crossing stays valid as a fence-violation
    /// candidate.
    #[serde(default = "default_perimeter_valid_duration_in_sec")]
    pub perimeter_valid_duration_in_sec: u64,
    /// Directory the collaborator dumps settings files into.
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,
}

impl Default for GeoFenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_geofence_enabled(),
            perimeter_valid_duration_in_sec: default_perimeter_valid_duration_in_sec(),
            dump_dir: default_dump_dir(),
        }
    }
}

fn default_geofence_enabled() -> bool {
    true
}
fn default_perimeter_valid_duration_in_sec() -> u64 {
    60
}
fn default_dump_dir() -> PathBuf {
    PathBuf::from("temp")
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_panic_button")]
    pub panic_button: bool,
    #[serde(default)]
    pub collect_violation_event: bool,
    #[serde(default = "default_collect_violation_interval_in_sec")]
    pub collect_violation_interval_in_sec: u64,
    #[serde(default = "default_granularity_for_continuous_violations_in_sec")]
    pub granularity_for_continuous_violations_in_sec: u64,
    #[serde(default)]
    pub send_notification_alarm: bool,
    #[serde(default = "default_notification_period_in_sec")]
    pub notification_period_in_sec: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            panic_button: default_panic_button(),
            collect_violation_event: false,
            collect_violation_interval_in_sec: default_collect_violation_interval_in_sec(),
            granularity_for_continuous_violations_in_sec:
                default_granularity_for_continuous_violations_in_sec(),
            send_notification_alarm: false,
            notification_period_in_sec: default_notification_period_in_sec(),
        }
    }
}

fn default_panic_button() -> bool {
    true
}
fn default_collect_violation_interval_in_sec() -> u64 {
    60
}
fn default_granularity_for_continuous_violations_in_sec() -> u64 {
    15
}
fn default_notification_period_in_sec() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Hours of tracking data the collaborator keeps.
    #[serde(default = "default_keep_hours")]
    pub keep_hours: u32,
    #[serde(default = "default_maintenance_period_in_sec")]
    pub maintenance_period_in_sec: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            keep_hours: default_keep_hours(),
            maintenance_period_in_sec: default_maintenance_period_in_sec(),
        }
    }
}

fn default_keep_hours() -> u32 {
    24
}
fn default_maintenance_period_in_sec() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[network]
recv_port = 9000
[engine]
worker_threads = 4
min_age_out_of_date_packet_in_sec = 2
[polling]
period_between_rftod_in_sec = 5
[geofence]
enabled = true
perimeter_valid_duration_in_sec = 10
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.network.recv_port, 9000);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert_eq!(cfg.engine.worker_threads, 4);
        assert_eq!(cfg.engine.min_age_out_of_date_packet_in_sec, 2);
        assert_eq!(cfg.engine.max_starvation_time_in_sec, 600);
        assert_eq!(cfg.engine.time_critical_priority, -20);
        assert_eq!(cfg.engine.low_priority, 13);
        assert_eq!(cfg.polling.period_between_rftod_in_sec, 5);
        assert_eq!(cfg.polling.period_between_rfhr_in_sec, 60);
        assert_eq!(cfg.registry.address_map_tolerance_in_sec, 120);
        assert_eq!(cfg.geofence.perimeter_valid_duration_in_sec, 10);
        assert_eq!(cfg.geofence.dump_dir, PathBuf::from("temp"));
        assert!(cfg.monitor.panic_button);
        assert!(!cfg.monitor.send_notification_alarm);
        assert_eq!(cfg.database.keep_hours, 24);
    }

    #[test]
    fn unknown_keys_ignored() {
        let cfg: Config = toml::from_str("[engine]\nnot_a_real_key = 7\n").unwrap();
        assert_eq!(cfg.engine.worker_threads, 8);
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nrecv_port = 12345").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        let cfg = Config::load();
        assert_eq!(cfg.network.recv_port, 12345);
        std::env::remove_var(ENV_CONFIG_PATH);
    }
}
