use serde::{Deserialize, Serialize};

use crate::command::{EmergencyChoice, PostMissionAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeoffStage {
    Started,
    Climbing,
    Complete,
    Failed,
}

/// How a battery emergency prompt was closed. A timeout behaves like RTL on
/// the vehicle but is reported separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyResolution {
    OperatorLand,
    OperatorRtl,
    TimeoutRtl,
}

impl EmergencyResolution {
    pub fn is_land(self) -> bool {
        matches!(self, EmergencyResolution::OperatorLand)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlightEvent {
    TakeoffProgress {
        mission_id: Option<String>,
        stage: TakeoffStage,
        altitude_m: Option<f64>,
        target_altitude_m: f64,
    },
    WaypointProgress {
        mission_id: String,
        waypoint: usize,
        total: usize,
        distance_m: f64,
        altitude_m: Option<f64>,
    },
    WaypointReached {
        mission_id: String,
        waypoint: usize,
        total: usize,
        lat: f64,
        lon: f64,
        alt: f64,
        elapsed_s: f64,
    },
    EmergencyPrompt {
        prompt_id: String,
        battery_percent: Option<u8>,
        distance_to_home_m: Option<f64>,
        altitude_m: Option<f64>,
        gps_fix: Option<u8>,
        recommendation: EmergencyChoice,
        reason: String,
        options: Vec<EmergencyChoice>,
        timeout_s: f64,
    },
    EmergencyCountdown {
        prompt_id: String,
        remaining_s: u64,
    },
    EmergencyAction {
        prompt_id: String,
        resolution: EmergencyResolution,
        maneuver_ok: bool,
    },
    MissionComplete {
        mission_id: String,
        action: PostMissionAction,
        detail: String,
    },
    MissionAborted {
        mission_id: String,
        reason: String,
        completed_waypoints: usize,
    },
    Failsafe {
        trigger: String,
        action: String,
        detail: String,
    },
}

/// Event plus wall-clock timestamp, as written to an external channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedEvent {
    pub ts_unix_ms: i64,
    #[serde(flatten)]
    pub event: FlightEvent,
}

impl StampedEvent {
    pub fn now(event: FlightEvent) -> Self {
        let ts_unix_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        Self { ts_unix_ms, event }
    }
}
