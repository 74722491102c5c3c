use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::geo::haversine_m;
use crate::waypoint::MissionWaypoint;

/// Horizontal cruise and vertical rate used for flight-time estimates.
pub const CRUISE_SPEED_MPS: f64 = 5.0;
pub const CLIMB_RATE_MPS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Created,
    Validated,
    Active,
    Completed,
    Aborted,
}

impl MissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MissionStatus::Completed | MissionStatus::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub center_lat: f64,
    pub center_lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionStats {
    pub total_waypoints: usize,
    pub total_distance_m: f64,
    pub estimated_flight_time_s: f64,
    pub altitude_min_m: f64,
    pub altitude_max_m: f64,
    pub altitude_avg_m: f64,
    pub bounding_box: Option<BoundingBox>,
}

impl MissionStats {
    pub fn compute(waypoints: &[MissionWaypoint]) -> Self {
        let total_distance_m: f64 = waypoints
            .windows(2)
            .map(|w| haversine_m(w[0].lat, w[0].lon, w[1].lat, w[1].lon))
            .sum();

        let vertical_s: f64 = waypoints
            .windows(2)
            .map(|w| (w[1].alt - w[0].alt).abs() / CLIMB_RATE_MPS)
            .sum();
        let estimated_flight_time_s = if total_distance_m == 0.0 {
            0.0
        } else {
            total_distance_m / CRUISE_SPEED_MPS + vertical_s
        };

        let (altitude_min_m, altitude_max_m, altitude_avg_m) = if waypoints.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let min = waypoints.iter().map(|w| w.alt).fold(f64::INFINITY, f64::min);
            let max = waypoints.iter().map(|w| w.alt).fold(f64::NEG_INFINITY, f64::max);
            let avg = waypoints.iter().map(|w| w.alt).sum::<f64>() / waypoints.len() as f64;
            (min, max, avg)
        };

        Self {
            total_waypoints: waypoints.len(),
            total_distance_m,
            estimated_flight_time_s,
            altitude_min_m,
            altitude_max_m,
            altitude_avg_m,
            bounding_box: bounding_box(waypoints),
        }
    }
}

fn bounding_box(waypoints: &[MissionWaypoint]) -> Option<BoundingBox> {
    let first = waypoints.first()?;
    let mut bb = BoundingBox {
        min_lat: first.lat,
        max_lat: first.lat,
        min_lon: first.lon,
        max_lon: first.lon,
        center_lat: 0.0,
        center_lon: 0.0,
    };
    for w in &waypoints[1..] {
        bb.min_lat = bb.min_lat.min(w.lat);
        bb.max_lat = bb.max_lat.max(w.lat);
        bb.min_lon = bb.min_lon.min(w.lon);
        bb.max_lon = bb.max_lon.max(w.lon);
    }
    bb.center_lat = (bb.min_lat + bb.max_lat) / 2.0;
    bb.center_lon = (bb.min_lon + bb.max_lon) / 2.0;
    Some(bb)
}

/// A processed waypoint plan plus its execution progress.
///
/// The waypoint list is fixed at construction; only the index and status
/// move, and only forward.
#[derive(Debug, Clone)]
pub struct Mission {
    id: String,
    waypoints: Vec<MissionWaypoint>,
    current_index: usize,
    status: MissionStatus,
    stats: MissionStats,
    created_at: OffsetDateTime,
    abort_reason: Option<String>,
}

impl Mission {
    pub fn new(waypoints: Vec<MissionWaypoint>) -> Self {
        let created_at = OffsetDateTime::now_utc();
        let id = format!("mission_{}", created_at.unix_timestamp_nanos() / 1_000_000);
        let stats = MissionStats::compute(&waypoints);
        Self {
            id,
            waypoints,
            current_index: 0,
            status: MissionStatus::Created,
            stats,
            created_at,
            abort_reason: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn waypoints(&self) -> &[MissionWaypoint] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn status(&self) -> MissionStatus {
        self.status
    }

    pub fn stats(&self) -> &MissionStats {
        &self.stats
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Waypoints reached so far.
    pub fn completed(&self) -> usize {
        self.current_index
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn mark_validated(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.status == MissionStatus::Created, "mission {} is {:?}, not created", self.id, self.status);
        anyhow::ensure!(!self.waypoints.is_empty(), "mission {} has no waypoints", self.id);
        self.status = MissionStatus::Validated;
        Ok(())
    }

    pub fn activate(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.status == MissionStatus::Validated, "mission {} is {:?}, not validated", self.id, self.status);
        self.status = MissionStatus::Active;
        Ok(())
    }

    /// Move past the current waypoint. Reaching the last one does not
    /// complete the mission; the post-mission action still has to finish.
    pub fn advance(&mut self) {
        if self.status != MissionStatus::Active {
            return;
        }
        self.current_index = (self.current_index + 1).min(self.waypoints.len());
    }

    pub fn complete(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.status == MissionStatus::Active, "mission {} is {:?}, not active", self.id, self.status);
        anyhow::ensure!(
            self.current_index == self.waypoints.len(),
            "mission {} has {} of {} waypoints left",
            self.id,
            self.waypoints.len() - self.current_index,
            self.waypoints.len()
        );
        self.status = MissionStatus::Completed;
        Ok(())
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = MissionStatus::Aborted;
        self.abort_reason = Some(reason.into());
    }
}
