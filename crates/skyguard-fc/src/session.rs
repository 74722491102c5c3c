//! One connected vehicle and everything that acts on it.
//!
//! `FlightSession::execute` is the single entry point for typed commands.
//! It is safe to call concurrently; that is how an emergency response or a
//! manual override reaches a mission that is still running.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use skyguard_proto::{CommandResult, FlightCommand};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::controller::{
    secs, Controller, DisarmOutcome, EscalationReport, FallbackStep, HoldOutcome, LandOptions, ManeuverError,
    ManeuverState, ManeuverTimeouts,
};
use crate::emergency::{EmergencyDesk, NegotiationPolicy};
use crate::events::EventSink;
use crate::ledger::CommandKind;
use crate::link::VehicleLink;
use crate::lock;
use crate::mission::{MissionConfig, MissionEnd, MissionEngine, MissionRequest, MissionView};
use crate::report::safety_report;
use crate::safety::{SafetyThresholds, VehicleProfile};
use crate::signals::EmergencyCause;
use crate::watchdog::{spawn_failsafe, spawn_heartbeat, WatchdogConfig};

/// Everything a session needs besides the link itself.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub safety: SafetyThresholds,
    pub timeouts: ManeuverTimeouts,
    pub mission: MissionConfig,
    pub emergency: NegotiationPolicy,
    pub watchdog: WatchdogConfig,
}

impl SessionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.safety.validate()?;
        self.timeouts.validate()?;
        self.mission.validate(&self.safety)?;
        self.emergency.validate()?;
        self.watchdog.validate()?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MissionStatusReport {
    Mission(MissionView),
    Hold { altitude_m: f64, duration_s: f64, elapsed_s: f64, remaining_s: f64, progress_percent: f64 },
    Idle,
}

pub struct FlightSession {
    controller: Arc<Controller>,
    missions: MissionEngine,
    watchdog: WatchdogConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FlightSession {
    pub fn new(link: Arc<dyn VehicleLink>, profile: VehicleProfile, cfg: SessionConfig, sink: Arc<dyn EventSink>) -> Self {
        let thresholds = Arc::new(cfg.safety);
        let desk = EmergencyDesk::new(cfg.emergency, sink.clone());
        let controller = Arc::new(Controller::new(link, thresholds, cfg.timeouts, profile, desk, sink));
        info!(event = "session_started", link = %controller.link().describe(), profile = ?profile);
        Self {
            missions: MissionEngine::new(controller.clone(), cfg.mission),
            controller,
            watchdog: cfg.watchdog,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Start the heartbeat and failsafe loops. Must be called from within a
    /// tokio runtime; calling it twice is a no-op.
    pub fn start_watchdogs(&self) {
        if !self.watchdog.enabled {
            warn!(event = "watchdogs_disabled");
            return;
        }
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            return;
        }
        tasks.push(spawn_heartbeat(self.controller.clone(), self.watchdog.clone()));
        tasks.push(spawn_failsafe(self.controller.clone(), self.watchdog.clone()));
    }

    pub fn shutdown(&self) {
        let mut tasks = lock(&self.tasks);
        for t in tasks.drain(..) {
            t.abort();
        }
        info!(event = "session_shutdown");
    }

    pub fn mission_status(&self) -> MissionStatusReport {
        if let Some(h) = self.controller.hold_progress() {
            let remaining_s = (h.duration_s - h.elapsed_s).max(0.0);
            let progress_percent = if h.duration_s > 0.0 { (h.elapsed_s / h.duration_s * 100.0).min(100.0) } else { 100.0 };
            return MissionStatusReport::Hold {
                altitude_m: h.altitude_m,
                duration_s: h.duration_s,
                elapsed_s: h.elapsed_s,
                remaining_s,
                progress_percent,
            };
        }
        match self.missions.status() {
            Some(v) => MissionStatusReport::Mission(v),
            None => MissionStatusReport::Idle,
        }
    }

    pub async fn execute(&self, cmd: FlightCommand) -> CommandResult {
        let name = cmd.name();
        info!(event = "command", command = name);
        let res = self.dispatch(cmd).await;
        match &res {
            r if r.is_ok() => info!(event = "command_result", command = name, detail = %r.detail),
            r => warn!(event = "command_result", command = name, status = ?r.status, detail = %r.detail),
        }
        res
    }

    async fn dispatch(&self, cmd: FlightCommand) -> CommandResult {
        let c = &self.controller;
        let t = c.timeouts();
        let default_alt = self.missions.config().takeoff_altitude_m;

        match cmd {
            FlightCommand::Arm => {
                let _ticket = match c.begin(CommandKind::Arm, secs(t.mode_s + t.arm_s)) {
                    Ok(k) => k,
                    Err(e) => return failed(e.into()),
                };
                match c.arm().await {
                    Ok(()) => CommandResult::ok("armed"),
                    Err(e) => failed(e),
                }
            }
            FlightCommand::Disarm => {
                let _ticket = match c.begin(CommandKind::Disarm, secs(t.disarm_s)) {
                    Ok(k) => k,
                    Err(e) => return failed(e.into()),
                };
                match c.disarm().await {
                    Ok(()) => CommandResult::ok("disarmed"),
                    Err(e) => failed(e),
                }
            }
            FlightCommand::ArmAndTakeoff { altitude_m } => {
                let alt = altitude_m.unwrap_or(default_alt);
                let _ticket = match c.begin(CommandKind::Takeoff, secs(t.mode_s + t.arm_s + t.arm_settle_s + t.takeoff_s)) {
                    Ok(k) => k,
                    Err(e) => return failed(e.into()),
                };
                match c.arm_and_takeoff(alt, None).await {
                    Ok(()) => CommandResult::ok(format!("airborne at {:.1}m", alt)),
                    Err(e) => failed(e),
                }
            }
            FlightCommand::Takeoff { altitude_m } => {
                let alt = altitude_m.unwrap_or(default_alt);
                let _ticket = match c.begin(CommandKind::Takeoff, secs(t.takeoff_s)) {
                    Ok(k) => k,
                    Err(e) => return failed(e.into()),
                };
                match c.takeoff(alt, None).await {
                    Ok(()) => CommandResult::ok(format!("airborne at {:.1}m", alt)),
                    Err(e) => failed(e),
                }
            }
            FlightCommand::Land { force_here, emergency_override } => {
                let _ticket = match c.begin(CommandKind::Land, secs(t.mode_s + t.rtl_s.max(t.land_s))) {
                    Ok(k) => k,
                    Err(e) => return failed(e.into()),
                };
                match c.land(LandOptions { force_here, emergency_override }).await {
                    Ok(l) => CommandResult::ok(l.describe()).with_payload(&l),
                    Err(e) => failed(e),
                }
            }
            FlightCommand::Rtl { emergency_override } => {
                let _ticket = match c.begin(CommandKind::Rtl, secs(t.mode_s + t.rtl_s)) {
                    Ok(k) => k,
                    Err(e) => return failed(e.into()),
                };
                match c.rtl(emergency_override).await {
                    Ok(l) => CommandResult::ok(l.describe()).with_payload(&l),
                    Err(e) => failed(e),
                }
            }
            FlightCommand::EmergencyDisarm { confirm } => {
                if confirm {
                    c.raise_emergency(EmergencyCause::Operator);
                }
                match c.emergency_disarm(confirm).await {
                    Ok(DisarmOutcome::Escalated { report }) => escalation_result("emergency disarm too high, landed instead", &report),
                    Ok(o) => CommandResult::ok("emergency disarm complete").with_payload(&o),
                    Err(e) => failed(e),
                }
            }
            FlightCommand::EmergencyLand => {
                c.raise_emergency(EmergencyCause::Operator);
                let report = c.emergency_land().await;
                escalation_result("emergency landing", &report)
            }
            FlightCommand::ForceLandHere => {
                c.raise_emergency(EmergencyCause::Operator);
                let report = c.force_land_here().await;
                escalation_result("forced landing", &report)
            }
            FlightCommand::SetThrottle { percent } => match c.set_throttle(percent).await {
                Ok(pwm) => CommandResult::ok(format!("throttle {:.0}% ({} PWM)", percent, pwm)).with_payload(&json!({ "pwm": pwm })),
                Err(e) => failed(e),
            },
            FlightCommand::ReleaseThrottle => match c.release_throttle() {
                Ok(()) => CommandResult::ok("throttle released"),
                Err(e) => failed(e),
            },
            FlightCommand::TimedHold { altitude_m, duration_s } => {
                let lease = secs(t.takeoff_s + duration_s + t.rtl_s + t.land_s + c.desk().policy().response_timeout_s);
                let _ticket = match c.begin(CommandKind::TimedHold, lease) {
                    Ok(k) => k,
                    Err(e) => return failed(e.into()),
                };
                match c.timed_hold(altitude_m, duration_s).await {
                    Ok(o) => hold_result(o),
                    Err(e) => failed(e),
                }
            }
            FlightCommand::WaypointMission { waypoints, takeoff_altitude_m, post_mission_action } => {
                let lease = self.missions.lease_for(waypoints.len());
                let _ticket = match c.begin(CommandKind::WaypointMission, lease) {
                    Ok(k) => k,
                    Err(e) => return failed(e.into()),
                };
                let req = MissionRequest { waypoints, takeoff_altitude_m, post_mission_action };
                match self.missions.execute(req).await {
                    Ok(r) => {
                        let res = match &r.end {
                            MissionEnd::Completed { .. } => {
                                CommandResult::ok(format!("mission {} complete: {} waypoints", r.mission_id, r.completed_waypoints))
                            }
                            MissionEnd::Overridden => CommandResult::warning(format!("mission {} stopped by manual override", r.mission_id)),
                            MissionEnd::BatteryEmergency { emergency } => CommandResult::warning(format!(
                                "mission {} aborted on battery emergency: {:?}, {}",
                                r.mission_id, emergency.negotiation.resolution, emergency.detail
                            )),
                            MissionEnd::Interrupted { cause } => {
                                CommandResult::error(format!("mission {} interrupted by emergency ({})", r.mission_id, cause))
                            }
                            MissionEnd::Aborted { reason } => CommandResult::error(format!("mission {} aborted: {}", r.mission_id, reason)),
                            MissionEnd::PostActionFailed { reason, escalation, .. } => {
                                let landed = escalation.as_ref().is_some_and(|e| e.succeeded().is_some());
                                if landed {
                                    CommandResult::warning(format!("mission {}: {}, emergency landing engaged", r.mission_id, reason))
                                } else {
                                    CommandResult::error(format!("mission {}: {}", r.mission_id, reason))
                                }
                            }
                        };
                        res.with_payload(&r)
                    }
                    Err(e) => failed(e),
                }
            }
            FlightCommand::EmergencyResponse { prompt_id, choice } => match c.desk().respond(&prompt_id, &choice) {
                Ok(ch) => CommandResult::ok(format!("{} accepted for {}", ch, prompt_id)),
                Err(e) => {
                    warn!(event = "emergency_response_rejected", prompt_id = %prompt_id, reason = %e);
                    CommandResult::error(e.to_string())
                }
            },
            FlightCommand::ManualOverride { engaged } => match c.manual_override(engaged) {
                Ok(()) if engaged => CommandResult::ok("manual override engaged, holding position"),
                Ok(()) => CommandResult::ok("manual override released"),
                Err(e) => failed(e),
            },
            FlightCommand::VerifyHome => match c.verify_home() {
                Ok(home) => CommandResult::ok(format!("home verified at ({:.6}, {:.6})", home.lat, home.lon)).with_payload(&home),
                Err(e) => CommandResult::error(e),
            },
            FlightCommand::HomeDistance => match c.home_distance() {
                Some(d) => CommandResult::ok(format!("{:.1}m from home", d)).with_payload(&json!({ "distance_m": d })),
                None => CommandResult::error("distance unavailable: no position or no valid home"),
            },
            FlightCommand::MissionStatus => {
                let status = self.mission_status();
                let detail = match &status {
                    MissionStatusReport::Mission(v) => {
                        format!("mission {} {:?}: {}/{}", v.mission_id, v.status, v.completed_waypoints, v.total_waypoints)
                    }
                    MissionStatusReport::Hold { progress_percent, .. } => format!("holding, {:.0}% done", progress_percent),
                    MissionStatusReport::Idle => "no mission".to_string(),
                };
                CommandResult::ok(detail).with_payload(&json!({
                    "state": c.state(),
                    "active_commands": c.active_commands().iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                    "mission": status,
                }))
            }
            FlightCommand::SafetyReport => {
                let report = safety_report(&c.snapshot(), c.thresholds(), c.gate());
                CommandResult::ok(format!("overall {:?}", report.overall)).with_payload(&report)
            }
        }
    }

    /// Wait until the controller reaches `state` or `timeout` passes.
    pub async fn wait_for_state(&self, state: ManeuverState, timeout: Duration) -> bool {
        crate::wait::wait_for(timeout, Duration::from_millis(100), || self.controller.state() == state)
            .await
            .is_ok()
    }
}

impl Drop for FlightSession {
    fn drop(&mut self) {
        for t in lock(&self.tasks).drain(..) {
            t.abort();
        }
    }
}

fn failed(e: ManeuverError) -> CommandResult {
    match e {
        ManeuverError::EscalationFailed(report) => CommandResult::error(e_detail(&report)).with_payload(&report),
        e => CommandResult::error(e.to_string()),
    }
}

fn e_detail(report: &EscalationReport) -> String {
    let tried: Vec<String> = report.attempts.iter().map(|a| format!("{:?}: {}", a.step, a.detail)).collect();
    format!("every emergency fallback failed ({})", tried.join("; "))
}

/// Success on the first fallback step is `ok`; a later step is `warning`.
fn escalation_result(what: &str, report: &EscalationReport) -> CommandResult {
    let first = report.attempts.first().map(|a| a.step);
    let res = match report.succeeded() {
        None => CommandResult::error(format!("{} failed", what)),
        Some(step) if Some(step) == first => CommandResult::ok(format!("{}: {:?} engaged", what, step)),
        Some(FallbackStep::ThrottleCut) => CommandResult::warning(format!("{}: only throttle cut succeeded", what)),
        Some(step) => CommandResult::warning(format!("{}: fell back to {:?}", what, step)),
    };
    res.with_payload(report)
}

fn hold_result(o: HoldOutcome) -> CommandResult {
    let res = match &o {
        HoldOutcome::Completed { landing } => CommandResult::ok(format!("hold complete, {}", landing.describe())),
        HoldOutcome::Overridden { held_s } => CommandResult::warning(format!("hold stopped by manual override after {:.0}s", held_s)),
        HoldOutcome::Interrupted { cause, held_s } => {
            CommandResult::error(format!("hold interrupted by emergency ({}) after {:.0}s", cause, held_s))
        }
        HoldOutcome::BatteryEmergency { emergency } => CommandResult::warning(format!(
            "hold ended on battery emergency: {:?}, {}",
            emergency.negotiation.resolution, emergency.detail
        )),
    };
    res.with_payload(&o)
}
