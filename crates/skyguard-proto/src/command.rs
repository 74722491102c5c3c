use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Waypoint as submitted by an operator. Altitude may be omitted and is
/// filled in by the mission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaypointInput {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub alt: Option<f64>,
}

/// What the vehicle does once every waypoint has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PostMissionAction {
    #[default]
    Rtl,
    Loiter,
    Land,
    None,
}

impl fmt::Display for PostMissionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PostMissionAction::Rtl => "RTL",
            PostMissionAction::Loiter => "LOITER",
            PostMissionAction::Land => "LAND",
            PostMissionAction::None => "NONE",
        };
        f.write_str(s)
    }
}

/// Operator answer to a battery emergency prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EmergencyChoice {
    Land,
    Rtl,
}

impl fmt::Display for EmergencyChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmergencyChoice::Land => f.write_str("LAND"),
            EmergencyChoice::Rtl => f.write_str("RTL"),
        }
    }
}

impl FromStr for EmergencyChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LAND" => Ok(EmergencyChoice::Land),
            "RTL" => Ok(EmergencyChoice::Rtl),
            other => Err(format!("invalid emergency choice '{}', expected LAND or RTL", other)),
        }
    }
}

/// Closed set of commands the flight core accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum FlightCommand {
    Arm,
    Disarm,
    ArmAndTakeoff {
        #[serde(default)]
        altitude_m: Option<f64>,
    },
    Takeoff {
        #[serde(default)]
        altitude_m: Option<f64>,
    },
    Land {
        #[serde(default)]
        force_here: bool,
        #[serde(default)]
        emergency_override: bool,
    },
    Rtl {
        #[serde(default)]
        emergency_override: bool,
    },
    EmergencyDisarm {
        #[serde(default)]
        confirm: bool,
    },
    EmergencyLand,
    ForceLandHere,
    SetThrottle {
        percent: f64,
    },
    ReleaseThrottle,
    TimedHold {
        altitude_m: f64,
        duration_s: f64,
    },
    WaypointMission {
        waypoints: Vec<WaypointInput>,
        #[serde(default)]
        takeoff_altitude_m: Option<f64>,
        #[serde(default)]
        post_mission_action: Option<PostMissionAction>,
    },
    /// Choice is kept as text so an invalid answer is rejected with a
    /// result instead of failing to decode.
    EmergencyResponse {
        prompt_id: String,
        choice: String,
    },
    ManualOverride {
        engaged: bool,
    },
    VerifyHome,
    HomeDistance,
    MissionStatus,
    SafetyReport,
}

impl FlightCommand {
    pub fn name(&self) -> &'static str {
        match self {
            FlightCommand::Arm => "arm",
            FlightCommand::Disarm => "disarm",
            FlightCommand::ArmAndTakeoff { .. } => "arm_and_takeoff",
            FlightCommand::Takeoff { .. } => "takeoff",
            FlightCommand::Land { .. } => "land",
            FlightCommand::Rtl { .. } => "rtl",
            FlightCommand::EmergencyDisarm { .. } => "emergency_disarm",
            FlightCommand::EmergencyLand => "emergency_land",
            FlightCommand::ForceLandHere => "force_land_here",
            FlightCommand::SetThrottle { .. } => "set_throttle",
            FlightCommand::ReleaseThrottle => "release_throttle",
            FlightCommand::TimedHold { .. } => "timed_hold",
            FlightCommand::WaypointMission { .. } => "waypoint_mission",
            FlightCommand::EmergencyResponse { .. } => "emergency_response",
            FlightCommand::ManualOverride { .. } => "manual_override",
            FlightCommand::VerifyHome => "verify_home",
            FlightCommand::HomeDistance => "home_distance",
            FlightCommand::MissionStatus => "mission_status",
            FlightCommand::SafetyReport => "safety_report",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
    Warning,
}

/// Structured outcome of every core operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: Status,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self { status: Status::Ok, detail: detail.into(), payload: None }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self { status: Status::Error, detail: detail.into(), payload: None }
    }

    pub fn warning(detail: impl Into<String>) -> Self {
        Self { status: Status::Warning, detail: detail.into(), payload: None }
    }

    /// Attach a payload; a value that fails to serialize is dropped.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tagged_commands() {
        let cmd: FlightCommand =
            serde_json::from_str(r#"{"command":"takeoff","altitude_m":12.5}"#).unwrap();
        assert_eq!(cmd, FlightCommand::Takeoff { altitude_m: Some(12.5) });

        let cmd: FlightCommand = serde_json::from_str(r#"{"command":"land"}"#).unwrap();
        assert_eq!(cmd, FlightCommand::Land { force_here: false, emergency_override: false });

        let cmd: FlightCommand = serde_json::from_str(
            r#"{"command":"waypoint_mission","waypoints":[{"lat":1.0,"lon":2.0}],"post_mission_action":"LOITER"}"#,
        )
        .unwrap();
        match cmd {
            FlightCommand::WaypointMission { waypoints, post_mission_action, takeoff_altitude_m } => {
                assert_eq!(waypoints[0].alt, None);
                assert_eq!(post_mission_action, Some(PostMissionAction::Loiter));
                assert_eq!(takeoff_altitude_m, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_command_is_a_decode_error() {
        assert!(serde_json::from_str::<FlightCommand>(r#"{"command":"barrel_roll"}"#).is_err());
    }

    #[test]
    fn emergency_choice_parsing() {
        assert_eq!("land".parse::<EmergencyChoice>(), Ok(EmergencyChoice::Land));
        assert_eq!(" RTL ".parse::<EmergencyChoice>(), Ok(EmergencyChoice::Rtl));
        assert!("hover".parse::<EmergencyChoice>().is_err());
    }

    #[test]
    fn result_omits_empty_payload() {
        let s = serde_json::to_string(&CommandResult::ok("armed")).unwrap();
        assert_eq!(s, r#"{"status":"ok","detail":"armed"}"#);

        let r = CommandResult::warning("far").with_payload(&serde_json::json!({"distance_m": 120.0}));
        assert_eq!(r.payload.unwrap()["distance_m"], 120.0);
    }
}
