//! Waypoint mission execution: process the plan, get airborne, fly each
//! waypoint with bounded polling, and finish with the post-mission action.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyguard_nav::{process_waypoints, validate_waypoint_list, Mission, MissionStats, MissionStatus, PipelineLimits};
use skyguard_proto::{FlightEvent, PostMissionAction, WaypointInput};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::controller::{secs, Controller, EmergencyOutcome, EscalationReport, LandOptions, Landing, ManeuverError, ManeuverState};
use crate::gate::GateFailure;
use crate::lock;
use crate::safety::SafetyThresholds;
use crate::signals::{Interruption, SignalWatch};
use crate::state::FlightMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    pub default_altitude_m: f64,
    pub takeoff_altitude_m: f64,
    pub min_separation_m: f64,
    pub arrival_tolerance_m: f64,
    pub waypoint_timeout_s: f64,
    pub poll_interval_s: f64,
    pub settle_s: f64,
    pub progress_log_interval_s: f64,
    pub progress_distance_delta_m: f64,
    pub progress_altitude_delta_m: f64,
    pub max_waypoints: usize,
    pub post_mission_action: PostMissionAction,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            default_altitude_m: 20.0,
            takeoff_altitude_m: 15.0,
            min_separation_m: 2.0,
            arrival_tolerance_m: 2.0,
            waypoint_timeout_s: 120.0,
            poll_interval_s: 0.5,
            settle_s: 2.0,
            progress_log_interval_s: 2.0,
            progress_distance_delta_m: 1.0,
            progress_altitude_delta_m: 1.0,
            max_waypoints: 50,
            post_mission_action: PostMissionAction::Rtl,
        }
    }
}

impl MissionConfig {
    pub fn limits(&self, t: &SafetyThresholds) -> PipelineLimits {
        PipelineLimits {
            default_alt_m: self.default_altitude_m,
            min_alt_m: t.min_altitude_m,
            max_alt_m: t.max_altitude_m,
            min_separation_m: self.min_separation_m,
        }
    }

    pub fn validate(&self, t: &SafetyThresholds) -> anyhow::Result<()> {
        anyhow::ensure!(
            (t.min_altitude_m..=t.max_altitude_m).contains(&self.default_altitude_m),
            "mission.default_altitude_m {} outside safety bounds {}..{}",
            self.default_altitude_m,
            t.min_altitude_m,
            t.max_altitude_m
        );
        anyhow::ensure!(
            (t.min_altitude_m..=t.max_altitude_m).contains(&self.takeoff_altitude_m),
            "mission.takeoff_altitude_m outside safety bounds"
        );
        anyhow::ensure!(self.arrival_tolerance_m > 0.0, "mission.arrival_tolerance_m must be positive");
        anyhow::ensure!(self.waypoint_timeout_s > 0.0, "mission.waypoint_timeout_s must be positive");
        anyhow::ensure!(self.poll_interval_s > 0.0, "mission.poll_interval_s must be positive");
        anyhow::ensure!(self.max_waypoints > 0, "mission.max_waypoints must be at least 1");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MissionRequest {
    pub waypoints: Vec<WaypointInput>,
    /// Arm and climb to this altitude first; `None` means already airborne.
    pub takeoff_altitude_m: Option<f64>,
    pub post_mission_action: Option<PostMissionAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "end", rename_all = "snake_case")]
pub enum MissionEnd {
    Completed { action: PostMissionAction, landing: Option<Landing> },
    Aborted { reason: String },
    Overridden,
    Interrupted { cause: String },
    BatteryEmergency { emergency: EmergencyOutcome },
    /// Every waypoint was reached but the post-mission action failed.
    PostActionFailed {
        action: PostMissionAction,
        reason: String,
        escalation: Option<EscalationReport>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionReport {
    pub mission_id: String,
    pub status: MissionStatus,
    pub end: MissionEnd,
    pub completed_waypoints: usize,
    pub total_waypoints: usize,
    pub stats: MissionStats,
    pub warnings: Vec<String>,
    pub min_battery_percent: Option<u8>,
    pub duration_s: f64,
}

/// Live view of the running (or last) mission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionView {
    pub mission_id: String,
    pub status: MissionStatus,
    pub current_waypoint: usize,
    pub total_waypoints: usize,
    pub completed_waypoints: usize,
    pub stats: MissionStats,
    pub created_unix_ms: i64,
    pub elapsed_s: f64,
}

struct ViewSlot {
    mission: Mission,
    started: Instant,
}

enum LegEnd {
    Reached,
    Stop(MissionEnd),
}

pub struct MissionEngine {
    controller: Arc<Controller>,
    config: MissionConfig,
    view: Mutex<Option<ViewSlot>>,
}

impl MissionEngine {
    pub fn new(controller: Arc<Controller>, config: MissionConfig) -> Self {
        Self { controller, config, view: Mutex::new(None) }
    }

    pub fn config(&self) -> &MissionConfig {
        &self.config
    }

    pub fn status(&self) -> Option<MissionView> {
        lock(&self.view).as_ref().map(|v| MissionView {
            mission_id: v.mission.id().to_string(),
            status: v.mission.status(),
            current_waypoint: (v.mission.current_index() + 1).min(v.mission.len()),
            total_waypoints: v.mission.len(),
            completed_waypoints: v.mission.completed(),
            stats: v.mission.stats().clone(),
            created_unix_ms: (v.mission.created_at().unix_timestamp_nanos() / 1_000_000) as i64,
            elapsed_s: v.started.elapsed().as_secs_f64(),
        })
    }

    /// Worst-case duration, used as the ledger lease.
    pub fn lease_for(&self, waypoints: usize) -> Duration {
        let t = self.controller.timeouts();
        secs(
            t.arm_s
                + t.takeoff_s
                + waypoints as f64 * (self.config.waypoint_timeout_s + self.config.settle_s)
                + self.controller.desk().policy().response_timeout_s
                + t.completion_disarm_s.max(t.land_s),
        )
    }

    /// Process and validate a plan without flying it.
    pub fn prepare(&self, waypoints: &[WaypointInput]) -> Result<(Mission, Vec<String>), ManeuverError> {
        let t = self.controller.thresholds();
        let processed = process_waypoints(waypoints, &self.config.limits(t));
        let home = self.controller.snapshot().valid_home();
        let mut warnings = processed.warnings;
        let advisories = validate_waypoint_list(&processed.waypoints, self.config.max_waypoints, home, t.max_distance_from_home_m)
            .map_err(ManeuverError::Rejected)?;
        warnings.extend(advisories);

        let mut mission = Mission::new(processed.waypoints);
        mission.mark_validated().map_err(|e| ManeuverError::Rejected(format!("{:#}", e)))?;
        info!(
            event = "mission_prepared",
            mission_id = mission.id(),
            waypoints = mission.len(),
            skipped = processed.skipped,
            merged = processed.merged,
            distance_m = mission.stats().total_distance_m,
            estimated_s = mission.stats().estimated_flight_time_s,
        );
        for w in &warnings {
            warn!(event = "mission_warning", mission_id = mission.id(), warning = %w);
        }
        Ok((mission, warnings))
    }

    fn precheck(&self) -> Result<(), ManeuverError> {
        let t = self.controller.thresholds();
        let snap = self.controller.snapshot();
        if let Some(percent) = snap.battery_percent() {
            if percent < t.mission_min_battery_percent {
                return Err(GateFailure::BatteryLow { percent, min: t.mission_min_battery_percent }.into());
            }
        }
        let satellites = snap.satellites().unwrap_or(0);
        if satellites < t.min_satellites {
            return Err(GateFailure::Satellites { satellites, required: t.min_satellites }.into());
        }
        self.controller.require_ready(false, false)?;
        Ok(())
    }

    pub async fn execute(&self, request: MissionRequest) -> Result<MissionReport, ManeuverError> {
        let (mut mission, warnings) = self.prepare(&request.waypoints)?;
        self.precheck()?;
        let _flag = self.controller.mission_flag()?;
        let action = request.post_mission_action.unwrap_or(self.config.post_mission_action);

        match request.takeoff_altitude_m {
            Some(alt) => self.controller.arm_and_takeoff(alt, Some(mission.id())).await?,
            None => {
                let snap = self.controller.snapshot();
                let airborne = snap.altitude().is_some_and(|a| a >= self.controller.thresholds().on_ground_altitude_m);
                if !snap.armed || !airborne {
                    return Err(ManeuverError::Rejected(
                        "vehicle must be armed and airborne, or give takeoff_altitude_m".into(),
                    ));
                }
                self.controller
                    .set_mode_confirmed(FlightMode::Guided, secs(self.controller.timeouts().mode_s))
                    .await?;
            }
        }

        // watch taken after takeoff so a takeoff-time override is not replayed
        let watch = self.controller.signals().watch();
        mission.activate().map_err(|e| ManeuverError::Rejected(format!("{:#}", e)))?;
        let started = Instant::now();
        let mission_id = mission.id().to_string();
        let total = mission.len();
        let waypoints = mission.waypoints().to_vec();
        *lock(&self.view) = Some(ViewSlot { mission: mission.clone(), started });
        self.controller.transition(ManeuverState::Navigating, "mission started");
        info!(event = "mission_started", mission_id = %mission_id, waypoints = total, post_action = %action);

        let mut min_battery = self.controller.snapshot().battery_percent();
        let mut end = None;

        for (i, wp) in waypoints.iter().enumerate() {
            let n = i + 1;
            match self.fly_leg(&mission_id, n, total, wp, &watch, &mut min_battery).await {
                Ok(LegEnd::Reached) => {}
                Ok(LegEnd::Stop(e)) => {
                    end = Some(e);
                    break;
                }
                Err(e) => {
                    end = Some(MissionEnd::Aborted { reason: e.to_string() });
                    break;
                }
            }
            mission.advance();
            self.sync_view(&mission);
            if n < total {
                sleep(secs(self.config.settle_s)).await;
            }
        }

        let end = match end {
            Some(e) => {
                let reason = match &e {
                    MissionEnd::Aborted { reason } => reason.clone(),
                    MissionEnd::Overridden => "manual override".to_string(),
                    MissionEnd::Interrupted { cause } => format!("emergency: {}", cause),
                    MissionEnd::BatteryEmergency { .. } => "battery emergency".to_string(),
                    MissionEnd::PostActionFailed { reason, .. } => reason.clone(),
                    MissionEnd::Completed { .. } => String::new(),
                };
                mission.abort(reason.clone());
                self.sync_view(&mission);
                e
            }
            None => {
                let end = self.finish(&mission_id, total, action, &watch).await;
                match &end {
                    MissionEnd::Completed { .. } => {
                        if let Err(e) = mission.complete() {
                            warn!(event = "mission_state", mission_id = %mission_id, error = %format!("{:#}", e));
                        }
                    }
                    MissionEnd::PostActionFailed { reason, .. } => mission.abort(reason.clone()),
                    _ => {}
                }
                self.sync_view(&mission);
                end
            }
        };

        let report = MissionReport {
            mission_id: mission_id.clone(),
            status: mission.status(),
            end,
            completed_waypoints: mission.completed(),
            total_waypoints: total,
            stats: mission.stats().clone(),
            warnings,
            min_battery_percent: min_battery,
            duration_s: started.elapsed().as_secs_f64(),
        };
        info!(
            event = "mission_summary",
            mission_id = %mission_id,
            status = ?report.status,
            visited = report.completed_waypoints,
            total,
            min_battery = ?report.min_battery_percent,
            duration_s = report.duration_s,
        );
        Ok(report)
    }

    fn sync_view(&self, mission: &Mission) {
        if let Some(v) = lock(&self.view).as_mut() {
            v.mission = mission.clone();
        }
    }

    fn aborted(&self, mission_id: &str, completed: usize, reason: &str) {
        warn!(event = "mission_aborted", mission_id, reason, completed_waypoints = completed);
        self.controller.sink().publish(FlightEvent::MissionAborted {
            mission_id: mission_id.to_string(),
            reason: reason.to_string(),
            completed_waypoints: completed,
        });
    }

    async fn fly_leg(
        &self,
        mission_id: &str,
        n: usize,
        total: usize,
        wp: &skyguard_nav::MissionWaypoint,
        watch: &SignalWatch,
        min_battery: &mut Option<u8>,
    ) -> Result<LegEnd, ManeuverError> {
        let c = &self.controller;
        let t = c.thresholds();
        let completed = n - 1;
        c.link()
            .command_goto(wp.lat, wp.lon, wp.alt)
            .map_err(ManeuverError::Link)?;
        info!(event = "waypoint_goto", mission_id, waypoint = n, total, lat = wp.lat, lon = wp.lon, alt = wp.alt);

        let leg_start = Instant::now();
        let timeout = secs(self.config.waypoint_timeout_s);
        let log_every = secs(self.config.progress_log_interval_s);
        let mut last_log: Option<(Instant, f64, Option<f64>)> = None;
        let target = wp.point();

        loop {
            match watch.interruption() {
                Some(Interruption::Override) => {
                    self.aborted(mission_id, completed, "manual override");
                    return Ok(LegEnd::Stop(MissionEnd::Overridden));
                }
                Some(Interruption::Emergency(cause)) => {
                    self.aborted(mission_id, completed, &format!("emergency: {}", cause));
                    return Ok(LegEnd::Stop(MissionEnd::Interrupted { cause: cause.to_string() }));
                }
                None => {}
            }

            let snap = c.snapshot();
            if let Some(b) = snap.battery_percent() {
                *min_battery = Some(min_battery.map_or(b, |m| m.min(b)));
                if b < t.critical_battery_percent {
                    error!(event = "mission_battery_critical", mission_id, battery = b, waypoint = n);
                    self.aborted(mission_id, completed, &format!("battery critical at {}%", b));
                    let emergency = c.handle_battery_emergency().await;
                    return Ok(LegEnd::Stop(MissionEnd::BatteryEmergency { emergency }));
                }
            }
            if snap.gps_fix().is_some_and(|f| f < t.command_gps_fix) {
                error!(event = "mission_gps_lost", mission_id, waypoint = n);
                self.aborted(mission_id, completed, "GPS fix lost");
                if let Err(e) = c.request_mode(FlightMode::AltHold) {
                    error!(event = "alt_hold_failed", error = %e);
                }
                return Ok(LegEnd::Stop(MissionEnd::Aborted { reason: "GPS fix lost".into() }));
            }

            if let Some(here) = snap.location() {
                let distance = here.distance_to(&target);
                if distance <= self.config.arrival_tolerance_m {
                    let elapsed_s = leg_start.elapsed().as_secs_f64();
                    info!(event = "waypoint_reached", mission_id, waypoint = n, total, elapsed_s);
                    c.sink().publish(FlightEvent::WaypointReached {
                        mission_id: mission_id.to_string(),
                        waypoint: n,
                        total,
                        lat: wp.lat,
                        lon: wp.lon,
                        alt: wp.alt,
                        elapsed_s,
                    });
                    return Ok(LegEnd::Reached);
                }
                let altitude = snap.altitude();
                let due = match last_log {
                    None => true,
                    Some((at, d, a)) => {
                        at.elapsed() >= log_every
                            || (d - distance).abs() > self.config.progress_distance_delta_m
                            || altitude_moved(a, altitude, self.config.progress_altitude_delta_m)
                    }
                };
                if due {
                    last_log = Some((Instant::now(), distance, altitude));
                    info!(event = "waypoint_progress", mission_id, waypoint = n, distance_m = distance, altitude_m = ?snap.altitude());
                    c.sink().publish(FlightEvent::WaypointProgress {
                        mission_id: mission_id.to_string(),
                        waypoint: n,
                        total,
                        distance_m: distance,
                        altitude_m: snap.altitude(),
                    });
                } else {
                    debug!(event = "waypoint_poll", waypoint = n, distance_m = distance);
                }
            }

            if leg_start.elapsed() >= timeout {
                let reason = format!("waypoint {} not reached within {:.0}s", n, timeout.as_secs_f64());
                self.aborted(mission_id, completed, &reason);
                if let Err(e) = c.request_mode(FlightMode::Loiter) {
                    warn!(event = "loiter_failed", error = %e);
                }
                return Ok(LegEnd::Stop(MissionEnd::Aborted { reason }));
            }
            sleep(secs(self.config.poll_interval_s)).await;
        }
    }

    async fn finish(&self, mission_id: &str, completed: usize, action: PostMissionAction, watch: &SignalWatch) -> MissionEnd {
        let c = &self.controller;
        info!(event = "mission_waypoints_done", mission_id, action = %action);
        let outcome = match action {
            PostMissionAction::Rtl => c.rtl_within(false, secs(c.timeouts().completion_disarm_s)).await.map(Some),
            PostMissionAction::Land => c.land(LandOptions { force_here: true, emergency_override: false }).await.map(Some),
            PostMissionAction::Loiter => c.request_mode(FlightMode::Loiter).map(|()| {
                c.transition(ManeuverState::Holding, "post-mission loiter");
                None
            }),
            PostMissionAction::None => {
                c.transition(ManeuverState::Airborne, "mission finished");
                Ok(None)
            }
        };

        match outcome {
            Ok(landing) => {
                let detail = match (&landing, action) {
                    (Some(l), _) => l.describe(),
                    (None, PostMissionAction::Loiter) => "loitering at last waypoint".to_string(),
                    (None, _) => "holding last setpoint".to_string(),
                };
                c.sink().publish(FlightEvent::MissionComplete { mission_id: mission_id.to_string(), action, detail: detail.clone() });
                info!(event = "mission_complete", mission_id, action = %action, detail = %detail);
                MissionEnd::Completed { action, landing }
            }
            Err(e) => {
                let reason = format!("post-mission {} failed: {}", action, e);
                error!(event = "post_mission_failed", mission_id, action = %action, error = %e);
                self.aborted(mission_id, completed, &reason);
                // an override or a running emergency maneuver already owns the vehicle
                let owned = watch.interruption().is_some() || c.in_emergency();
                let escalation = match action {
                    PostMissionAction::Rtl if !owned => Some(c.emergency_land().await),
                    PostMissionAction::Land if !owned => Some(c.force_land_here().await),
                    _ => None,
                };
                MissionEnd::PostActionFailed { action, reason, escalation }
            }
        }
    }
}

fn altitude_moved(last: Option<f64>, now: Option<f64>, delta_m: f64) -> bool {
    match (last, now) {
        (Some(a), Some(b)) => (a - b).abs() > delta_m,
        (None, Some(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fits_default_thresholds() {
        let t = SafetyThresholds::default();
        assert!(MissionConfig::default().validate(&t).is_ok());
        let bad = MissionConfig { default_altitude_m: 45.0, ..Default::default() };
        assert!(bad.validate(&t).is_err());
    }

    #[test]
    fn limits_follow_thresholds() {
        let t = SafetyThresholds::default();
        let l = MissionConfig::default().limits(&t);
        assert_eq!(l.max_alt_m, 30.0);
        assert_eq!(l.min_alt_m, 0.5);
        assert_eq!(l.min_separation_m, 2.0);
    }

    #[test]
    fn altitude_change_triggers_progress() {
        assert!(altitude_moved(Some(10.0), Some(11.5), 1.0));
        assert!(altitude_moved(Some(10.0), Some(8.9), 1.0));
        assert!(!altitude_moved(Some(10.0), Some(10.6), 1.0));
        assert!(altitude_moved(None, Some(10.0), 1.0));
        assert!(!altitude_moved(Some(10.0), None, 1.0));
    }
}
