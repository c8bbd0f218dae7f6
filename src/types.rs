use crate::error::{FireplaceError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Highest flame height step a fireplace accepts
pub const MAX_HEIGHT: u8 = 4;

/// Highest fan speed step a fireplace accepts
pub const MAX_FAN_SPEED: u8 = 4;

/// A fireplace as enumerated by the cloud service
///
/// Identity is immutable; re-enumeration replaces the whole record rather
/// than mutating it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub serial: String,
    pub brand: String,

    /// Per-device key used to sign commands on the local transport.
    /// Absent on accounts that never provisioned the local API.
    #[serde(default)]
    pub apikey: Option<String>,
}

/// Response from the cloud `enumlocations` endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct Locations {
    pub locations: Vec<Location>,
}

/// A single location and the fireplaces registered to it
#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    pub location_id: String,
    #[serde(default)]
    pub fireplaces: Vec<Device>,
}

/// Self-announcement payload a fireplace broadcasts over UDP
#[derive(Debug, Clone, Deserialize)]
pub struct Announcement {
    pub ip: String,
    pub uuid: String,
}

/// Decoded state of a fireplace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FireplaceState {
    /// Desired power state. Set optimistically when a command is issued so
    /// subscribers see the change before the device confirms it.
    pub power: bool,

    /// Flame height, 0 (off) to [`MAX_HEIGHT`]
    pub height: u8,

    /// Fan speed, 0 (off) to [`MAX_FAN_SPEED`]
    pub fan_speed: u8,

    /// Accent light state
    pub light: bool,

    /// Last power state the device itself reported. Height commands are
    /// capped until this confirms ignition, since the burner cannot safely
    /// jump straight to a high flame level.
    pub ack_power: bool,

    /// Device-reported timestamp of the last state change, when present
    pub timestamp: Option<u64>,
}

/// A setting change to submit to a fireplace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Power(bool),
    Height(u8),
    FanSpeed(u8),
    Light(bool),
}

impl Command {
    /// Wire name of the setting
    pub fn name(&self) -> &'static str {
        match self {
            Command::Power(_) => "power",
            Command::Height(_) => "height",
            Command::FanSpeed(_) => "fanspeed",
            Command::Light(_) => "light",
        }
    }

    /// Wire value: `"0"`/`"1"` for switches, a decimal step for levels
    pub fn value(&self) -> String {
        match self {
            Command::Power(on) | Command::Light(on) => {
                if *on { "1" } else { "0" }.to_string()
            }
            Command::Height(level) | Command::FanSpeed(level) => level.to_string(),
        }
    }

    /// Whether rapid repeats of this command should be coalesced before
    /// transmission. Analog settings arrive once per UI drag tick; switches
    /// are rare and idempotent.
    pub(crate) fn is_debounced(&self) -> bool {
        matches!(self, Command::Height(_) | Command::FanSpeed(_))
    }
}

/// Parse a state snapshot from a cloud or local poll body.
///
/// The endpoints are loose about types: `power` and `light` arrive as
/// `"0"`/`"1"` strings, numbers, or booleans depending on firmware
/// revision, and `height`/`fanspeed` as strings or numbers.
pub(crate) fn parse_state(json: &Value) -> Result<FireplaceState> {
    let power = flag_field(json, "power")
        .ok_or_else(|| FireplaceError::InvalidResponse("missing or invalid power field".to_string()))?;

    let height = level_field(json, "height").unwrap_or(0).min(MAX_HEIGHT);
    let fan_speed = level_field(json, "fanspeed").unwrap_or(0).min(MAX_FAN_SPEED);
    let light = flag_field(json, "light").unwrap_or(false);
    let timestamp = json.get("timestamp").and_then(Value::as_u64);

    Ok(FireplaceState {
        power,
        height,
        fan_speed,
        light,
        ack_power: power,
        timestamp,
    })
}

fn flag_field(json: &Value, field: &str) -> Option<bool> {
    match json.get(field)? {
        Value::String(s) => match s.as_str() {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_u64().map(|n| n != 0),
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

fn level_field(json: &Value, field: &str) -> Option<u8> {
    match json.get(field)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        _ => None,
    }
}
