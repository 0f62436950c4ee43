//! Wire protocol shared with gateways and the IPC tool.
//!
//! Every datagram is ASCII text: a semicolon-delimited three-field header
//! (`direction;type;api_version;`) followed by an opaque remainder whose
//! grammar depends on the packet type.

use thiserror::Error;

/// Maximum datagram body size in bytes.
pub const MESSAGE_LENGTH: usize = 4096;

/// API version stamped on every packet this server emits.
pub const API_VERSION_LATEST: &str = "2.2";

/// Gateways speaking the 2.0 dialect predate battery-voltage reporting;
/// their tracking payloads are not persisted.
pub const API_VERSION_20: f32 = 2.0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram is not ASCII text")]
    NotText,
    #[error("truncated header")]
    TruncatedHeader,
    #[error("unknown packet direction {0}")]
    UnknownDirection(i32),
    #[error("unknown packet type {0}")]
    UnknownType(i32),
    #[error("malformed {0} field")]
    MalformedField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktDirection {
    FromServer,
    FromGui,
    FromGateway,
    FromBeacon,
}

impl PktDirection {
    pub fn code(self) -> i32 {
        match self {
            PktDirection::FromServer => 2,
            PktDirection::FromGui => 3,
            PktDirection::FromGateway => 6,
            PktDirection::FromBeacon => 8,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, WireError> {
        match code {
            2 => Ok(PktDirection::FromServer),
            3 => Ok(PktDirection::FromGui),
            6 => Ok(PktDirection::FromGateway),
            8 => Ok(PktDirection::FromBeacon),
            other => Err(WireError::UnknownDirection(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktType {
    RequestToJoin,
    JoinResponse,
    TimeCriticalTrackedObjectData,
    TrackedObjectData,
    GatewayHealthReport,
    BeaconHealthReport,
    NotificationAlarm,
    IpcCommand,
}

impl PktType {
    pub fn code(self) -> i32 {
        match self {
            PktType::RequestToJoin => 1,
            PktType::JoinResponse => 2,
            PktType::TimeCriticalTrackedObjectData => 3,
            PktType::TrackedObjectData => 4,
            PktType::GatewayHealthReport => 5,
            PktType::BeaconHealthReport => 6,
            PktType::NotificationAlarm => 7,
            PktType::IpcCommand => 8,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, WireError> {
        match code {
            1 => Ok(PktType::RequestToJoin),
            2 => Ok(PktType::JoinResponse),
            3 => Ok(PktType::TimeCriticalTrackedObjectData),
            4 => Ok(PktType::TrackedObjectData),
            5 => Ok(PktType::GatewayHealthReport),
            6 => Ok(PktType::BeaconHealthReport),
            7 => Ok(PktType::NotificationAlarm),
            8 => Ok(PktType::IpcCommand),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WireHeader {
    pub direction: PktDirection,
    pub pkt_type: PktType,
    pub api_version: f32,
}

/// Split the three header fields off a datagram and return the header plus
/// the opaque remainder.
pub fn parse_header(payload: &[u8]) -> Result<(WireHeader, &str), WireError> {
    let text = std::str::from_utf8(payload).map_err(|_| WireError::NotText)?;
    let mut fields = text.splitn(4, ';');

    let direction = fields
        .next()
        .and_then(|f| f.trim().parse::<i32>().ok())
        .ok_or(WireError::TruncatedHeader)?;
    let pkt_type = fields
        .next()
        .and_then(|f| f.trim().parse::<i32>().ok())
        .ok_or(WireError::TruncatedHeader)?;
    let api_version = fields
        .next()
        .and_then(|f| f.trim().parse::<f32>().ok())
        .ok_or(WireError::TruncatedHeader)?;
    let rest = fields.next().ok_or(WireError::TruncatedHeader)?;

    Ok((
        WireHeader {
            direction: PktDirection::from_code(direction)?,
            pkt_type: PktType::from_code(pkt_type)?,
            api_version,
        },
        rest,
    ))
}

/// Build the `direction;type;api_version;` prefix for an outgoing packet.
pub fn format_header(direction: PktDirection, pkt_type: PktType) -> String {
    format!(
        "{};{};{};",
        direction.code(),
        pkt_type.code(),
        API_VERSION_LATEST
    )
}

/// Area id of a beacon: the decimal integer formed by the first four
/// characters of its UUID.
pub fn area_id_of(beacon_uuid: &str) -> Option<u32> {
    beacon_uuid.get(..4)?.parse().ok()
}

/// One detected device inside a tracked-object report.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    /// Normalized to lowercase; comparisons are case-insensitive on the wire.
    pub mac: String,
    pub initial_timestamp: String,
    pub final_timestamp: String,
    pub rssi: i32,
    pub panic: bool,
    pub battery_voltage: String,
}

/// Parsed body of a (time-critical-)tracked-object-data packet.
///
/// The wire grammar is
/// `uuid;datetime;beacon_ip;{type;count;{mac;ts_i;ts_f;rssi;panic;batt;}xcount}x2`
/// where the two blocks carry the BR/EDR and BLE device classes. The blocks
/// are flattened here; the core never distinguishes the classes.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObjectReport {
    pub beacon_uuid: String,
    pub datetime: String,
    pub beacon_ip: String,
    pub objects: Vec<DetectedObject>,
}

const DEVICE_CLASSES: usize = 2;
const MAC_ADDRESS_LEN: usize = 17;

pub fn parse_tracked_object_report(body: &str) -> Result<TrackedObjectReport, WireError> {
    let mut fields = body.split(';');

    let beacon_uuid = fields
        .next()
        .filter(|f| !f.is_empty())
        .ok_or(WireError::MalformedField("uuid"))?
        .to_string();
    let datetime = fields
        .next()
        .ok_or(WireError::MalformedField("datetime"))?
        .to_string();
    let beacon_ip = fields
        .next()
        .ok_or(WireError::MalformedField("beacon_ip"))?
        .to_string();

    let mut objects = Vec::new();
    for _ in 0..DEVICE_CLASSES {
        let _object_type = fields.next().ok_or(WireError::MalformedField("type"))?;
        let count: usize = fields
            .next()
            .and_then(|f| f.trim().parse().ok())
            .ok_or(WireError::MalformedField("count"))?;

        for _ in 0..count {
            let mac = fields.next().ok_or(WireError::MalformedField("mac"))?;
            if mac.len() != MAC_ADDRESS_LEN {
                return Err(WireError::MalformedField("mac"));
            }
            let initial_timestamp = fields
                .next()
                .ok_or(WireError::MalformedField("ts_initial"))?
                .to_string();
            let final_timestamp = fields
                .next()
                .ok_or(WireError::MalformedField("ts_final"))?
                .to_string();
            let rssi = fields
                .next()
                .and_then(|f| f.trim().parse().ok())
                .ok_or(WireError::MalformedField("rssi"))?;
            let panic = fields.next().ok_or(WireError::MalformedField("panic"))? == "1";
            let battery_voltage = fields
                .next()
                .ok_or(WireError::MalformedField("battery"))?
                .to_string();

            objects.push(DetectedObject {
                mac: mac.to_ascii_lowercase(),
                initial_timestamp,
                final_timestamp,
                rssi,
                panic,
                battery_voltage,
            });
        }
    }

    Ok(TrackedObjectReport {
        beacon_uuid,
        datetime,
        beacon_ip,
        objects,
    })
}

/// Body of a notification-alarm packet: `alarm_type;duration_sec;agents_csv;`.
pub fn notification_alarm_body(alarm_type: u32, duration_sec: u32, agents_csv: &str) -> String {
    format!("{alarm_type};{duration_sec};{agents_csv};")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoFenceReloadKind {
    All,
    ListOnly,
    ObjectsOnly,
}

impl GeoFenceReloadKind {
    pub fn code(self) -> i32 {
        match self {
            GeoFenceReloadKind::All => 1,
            GeoFenceReloadKind::ListOnly => 2,
            GeoFenceReloadKind::ObjectsOnly => 3,
        }
    }

    fn from_code(code: i32) -> Result<Self, WireError> {
        match code {
            1 => Ok(GeoFenceReloadKind::All),
            2 => Ok(GeoFenceReloadKind::ListOnly),
            3 => Ok(GeoFenceReloadKind::ObjectsOnly),
            _ => Err(WireError::MalformedField("reload_kind")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaScope {
    All,
    One(u32),
}

/// The one IPC command the server acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadCommand {
    pub kind: GeoFenceReloadKind,
    pub scope: AreaScope,
}

const CMD_RELOAD_GEO_FENCE_SETTING: i32 = 1;

/// Parse an IPC command body (`command_code;...`). Commands the server does
/// not act on parse to `None`.
pub fn parse_ipc_command(body: &str) -> Result<Option<ReloadCommand>, WireError> {
    let mut fields = body.split(';');

    let code: i32 = fields
        .next()
        .and_then(|f| f.trim().parse().ok())
        .ok_or(WireError::MalformedField("command_code"))?;
    if code != CMD_RELOAD_GEO_FENCE_SETTING {
        return Ok(None);
    }

    let kind = fields
        .next()
        .and_then(|f| f.trim().parse::<i32>().ok())
        .map(GeoFenceReloadKind::from_code)
        .ok_or(WireError::MalformedField("reload_kind"))??;

    let scope = match fields
        .next()
        .and_then(|f| f.trim().parse::<i32>().ok())
        .ok_or(WireError::MalformedField("area_scope"))?
    {
        1 => AreaScope::All,
        2 => {
            let area_id = fields
                .next()
                .and_then(|f| f.trim().parse().ok())
                .ok_or(WireError::MalformedField("area_id"))?;
            AreaScope::One(area_id)
        }
        _ => return Err(WireError::MalformedField("area_scope")),
    };

    Ok(Some(ReloadCommand { kind, scope }))
}
