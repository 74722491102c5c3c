//! Maneuver state machine.
//!
//! Every maneuver is a command to the vehicle followed by bounded polling
//! of telemetry until the expected state shows up. Nothing here trusts a
//! command acknowledgement; only observed state counts.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyguard_nav::GeoPoint;
use skyguard_proto::{EmergencyResolution, FlightEvent, TakeoffStage};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::emergency::{EmergencyContext, EmergencyDesk, Negotiation};
use crate::events::EventSink;
use crate::gate::{GateFailure, ReadinessGate};
use crate::ledger::{CommandKind, Conflict, FlightCommandLedger};
use crate::link::VehicleLink;
use crate::lock;
use crate::safety::{SafetyThresholds, VehicleProfile};
use crate::signals::{EmergencyCause, FlightSignals, Interruption, SignalWatch};
use crate::state::{FlightMode, VehicleSnapshot};
use crate::wait::{wait_for, wait_for_unless_emergency, WaitError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManeuverTimeouts {
    pub mode_s: f64,
    pub arm_s: f64,
    pub disarm_s: f64,
    pub takeoff_s: f64,
    pub land_s: f64,
    pub rtl_s: f64,
    pub emergency_mode_s: f64,
    pub emergency_rtl_s: f64,
    pub emergency_land_s: f64,
    pub emergency_disarm_s: f64,
    /// Post-mission RTL wait for disarm.
    pub completion_disarm_s: f64,
    pub force_land_mode_s: f64,
    pub throttle_verify_s: f64,
    /// Pause between arming and the takeoff command.
    pub arm_settle_s: f64,

    pub poll_s: f64,
    pub takeoff_poll_s: f64,
    pub land_poll_s: f64,
    pub rtl_poll_s: f64,
    pub hold_poll_s: f64,
}

impl Default for ManeuverTimeouts {
    fn default() -> Self {
        Self {
            mode_s: 10.0,
            arm_s: 20.0,
            disarm_s: 15.0,
            takeoff_s: 30.0,
            land_s: 60.0,
            rtl_s: 120.0,
            emergency_mode_s: 5.0,
            emergency_rtl_s: 60.0,
            emergency_land_s: 30.0,
            emergency_disarm_s: 8.0,
            completion_disarm_s: 120.0,
            force_land_mode_s: 5.0,
            throttle_verify_s: 2.0,
            arm_settle_s: 0.5,
            poll_s: 0.5,
            takeoff_poll_s: 0.5,
            land_poll_s: 1.0,
            rtl_poll_s: 2.0,
            hold_poll_s: 1.0,
        }
    }
}

pub(crate) fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s.max(0.0))
}

impl ManeuverTimeouts {
    pub fn validate(&self) -> anyhow::Result<()> {
        let all = [
            self.mode_s,
            self.arm_s,
            self.disarm_s,
            self.takeoff_s,
            self.land_s,
            self.rtl_s,
            self.emergency_mode_s,
            self.emergency_rtl_s,
            self.emergency_land_s,
            self.emergency_disarm_s,
            self.completion_disarm_s,
            self.force_land_mode_s,
            self.poll_s,
            self.takeoff_poll_s,
            self.land_poll_s,
            self.rtl_poll_s,
            self.hold_poll_s,
        ];
        anyhow::ensure!(all.iter().all(|t| t.is_finite() && *t > 0.0), "timeouts must all be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManeuverState {
    Disarmed,
    Armed,
    Airborne,
    Navigating,
    Holding,
    Landing,
    Returning,
    Emergency,
}

impl fmt::Display for ManeuverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManeuverState::Disarmed => "disarmed",
            ManeuverState::Armed => "armed",
            ManeuverState::Airborne => "airborne",
            ManeuverState::Navigating => "navigating",
            ManeuverState::Holding => "holding",
            ManeuverState::Landing => "landing",
            ManeuverState::Returning => "returning",
            ManeuverState::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ManeuverError {
    #[error("precondition failed: {0}")]
    Precondition(#[from] GateFailure),
    #[error("{0}")]
    Rejected(String),
    #[error("timed out after {after_s:.0}s waiting for {what}")]
    Timeout { what: String, after_s: f64 },
    #[error(transparent)]
    Conflict(#[from] Conflict),
    #[error("vehicle link: {0:#}")]
    Link(anyhow::Error),
    #[error("interrupted by {0}")]
    Interrupted(Interruption),
    #[error("every emergency fallback failed")]
    EscalationFailed(EscalationReport),
}

impl ManeuverError {
    fn waiting(what: impl Into<String>, e: WaitError) -> Self {
        match e {
            WaitError::TimedOut { after } => ManeuverError::Timeout { what: what.into(), after_s: after.as_secs_f64() },
            WaitError::Interrupted(i) => ManeuverError::Interrupted(i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStep {
    ReturnToLaunch,
    LandHere,
    ThrottleCut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepAttempt {
    pub step: FallbackStep,
    /// The vehicle accepted the step (mode confirmed or override sent).
    pub engaged: bool,
    /// The vehicle ended up disarmed on the ground.
    pub completed: bool,
    pub detail: String,
}

/// What an emergency escalation tried and where it stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EscalationReport {
    pub attempts: Vec<StepAttempt>,
}

impl EscalationReport {
    /// Last step the vehicle accepted.
    pub fn succeeded(&self) -> Option<FallbackStep> {
        self.attempts.iter().rev().find(|a| a.engaged).map(|a| a.step)
    }

    fn push(&mut self, step: FallbackStep, engaged: bool, completed: bool, detail: impl Into<String>) {
        let detail = detail.into();
        info!(event = "escalation_step", step = ?step, engaged, completed, detail = %detail);
        self.attempts.push(StepAttempt { step, engaged, completed, detail });
    }
}

/// How a land or RTL request ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Landing {
    AlreadyOnGround,
    Here,
    AtHome,
    /// RTL was not possible and emergency landing took over.
    Escalated { report: EscalationReport },
}

impl Landing {
    pub fn describe(&self) -> String {
        match self {
            Landing::AlreadyOnGround => "already on the ground".to_string(),
            Landing::Here => "landed at current position".to_string(),
            Landing::AtHome => "returned and landed at home".to_string(),
            Landing::Escalated { report } => match report.succeeded() {
                Some(step) => format!("home unavailable, emergency {:?} engaged", step),
                None => "home unavailable, emergency landing failed".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LandOptions {
    /// Descend at the current position instead of returning home first.
    pub force_here: bool,
    pub emergency_override: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DisarmOutcome {
    Disarmed,
    AlreadyDisarmed,
    /// Too high to cut motors; landed instead.
    Escalated { report: EscalationReport },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyOutcome {
    pub negotiation: Negotiation,
    pub maneuver_ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HoldOutcome {
    Completed { landing: Landing },
    Overridden { held_s: f64 },
    Interrupted { cause: String, held_s: f64 },
    BatteryEmergency { emergency: EmergencyOutcome },
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HoldProgress {
    pub altitude_m: f64,
    pub duration_s: f64,
    pub elapsed_s: f64,
}

#[derive(Debug, Clone, Copy)]
struct HoldClock {
    started: Instant,
    altitude_m: f64,
    duration: Duration,
}

/// Releases a ledger entry when dropped, so a cancelled command cannot
/// leave its entry behind.
pub struct LedgerTicket<'a> {
    controller: &'a Controller,
    kind: CommandKind,
    ticket: u64,
}

impl Drop for LedgerTicket<'_> {
    fn drop(&mut self) {
        lock(&self.controller.ledger).finish(self.kind, self.ticket);
    }
}

/// Held for the whole of an emergency maneuver. Nested maneuvers (an RTL
/// that falls back to landing) stack.
pub(crate) struct EmergencyGuard<'a>(&'a AtomicUsize);

impl Drop for EmergencyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a mission or hold as running until dropped.
pub(crate) struct MissionFlag<'a>(&'a AtomicBool);

impl Drop for MissionFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Controller {
    link: Arc<dyn VehicleLink>,
    thresholds: Arc<SafetyThresholds>,
    timeouts: ManeuverTimeouts,
    profile: VehicleProfile,
    gate: ReadinessGate,
    ledger: Mutex<FlightCommandLedger>,
    state: Mutex<ManeuverState>,
    commanded_mode: Mutex<Option<FlightMode>>,
    hold: Mutex<Option<HoldClock>>,
    mission_active: AtomicBool,
    emergency_depth: AtomicUsize,
    /// An emergency descent was started and may still be under way after
    /// its maneuver returned (force-land does not wait for touchdown).
    emergency_descent: AtomicBool,
    signals: FlightSignals,
    desk: EmergencyDesk,
    sink: Arc<dyn EventSink>,
}

impl Controller {
    pub fn new(
        link: Arc<dyn VehicleLink>,
        thresholds: Arc<SafetyThresholds>,
        timeouts: ManeuverTimeouts,
        profile: VehicleProfile,
        desk: EmergencyDesk,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let initial = if link.snapshot().armed { ManeuverState::Armed } else { ManeuverState::Disarmed };
        Self {
            gate: ReadinessGate::new(thresholds.clone()),
            ledger: Mutex::new(FlightCommandLedger::new(thresholds.command_timeout())),
            state: Mutex::new(initial),
            commanded_mode: Mutex::new(None),
            hold: Mutex::new(None),
            mission_active: AtomicBool::new(false),
            emergency_depth: AtomicUsize::new(0),
            emergency_descent: AtomicBool::new(false),
            signals: FlightSignals::new(),
            link,
            thresholds,
            timeouts,
            profile,
            desk,
            sink,
        }
    }

    pub fn snapshot(&self) -> VehicleSnapshot {
        self.link.snapshot()
    }

    pub fn link(&self) -> &dyn VehicleLink {
        self.link.as_ref()
    }

    pub fn thresholds(&self) -> &SafetyThresholds {
        &self.thresholds
    }

    pub fn timeouts(&self) -> &ManeuverTimeouts {
        &self.timeouts
    }

    pub fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    pub fn signals(&self) -> &FlightSignals {
        &self.signals
    }

    pub fn desk(&self) -> &EmergencyDesk {
        &self.desk
    }

    pub fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    pub fn state(&self) -> ManeuverState {
        *lock(&self.state)
    }

    /// True while an emergency maneuver runs, and afterwards until the
    /// vehicle it brought down is disarmed.
    pub fn in_emergency(&self) -> bool {
        self.emergency_depth.load(Ordering::SeqCst) > 0
            || self.state() == ManeuverState::Emergency
            || (self.emergency_descent.load(Ordering::SeqCst) && self.snapshot().armed)
    }

    pub(crate) fn emergency_guard(&self) -> EmergencyGuard<'_> {
        self.emergency_depth.fetch_add(1, Ordering::SeqCst);
        self.emergency_descent.store(true, Ordering::SeqCst);
        EmergencyGuard(&self.emergency_depth)
    }

    pub fn commanded_mode(&self) -> Option<FlightMode> {
        *lock(&self.commanded_mode)
    }

    pub fn mission_active(&self) -> bool {
        self.mission_active.load(Ordering::SeqCst)
    }

    pub fn hold_progress(&self) -> Option<HoldProgress> {
        lock(&self.hold).map(|h| HoldProgress {
            altitude_m: h.altitude_m,
            duration_s: h.duration.as_secs_f64(),
            elapsed_s: h.started.elapsed().as_secs_f64(),
        })
    }

    pub(crate) fn transition(&self, to: ManeuverState, why: &str) {
        let mut st = lock(&self.state);
        let from = *st;
        if from != to {
            info!(event = "maneuver_transition", from = %from, to = %to, why);
            *st = to;
        }
    }

    /// Register a command in the ledger for as long as the ticket lives.
    pub fn begin(&self, kind: CommandKind, lease: Duration) -> Result<LedgerTicket<'_>, Conflict> {
        let ticket = lock(&self.ledger).begin_with_lease(kind, lease)?;
        Ok(LedgerTicket { controller: self, kind, ticket })
    }

    pub fn active_commands(&self) -> Vec<CommandKind> {
        lock(&self.ledger).active_kinds()
    }

    pub fn clear_ledger(&self, reason: &str) {
        lock(&self.ledger).clear_for_emergency(reason);
    }

    /// Declare an emergency: every foreground loop watching signals stops.
    pub fn raise_emergency(&self, cause: EmergencyCause) {
        self.signals.raise_emergency(cause);
        self.clear_ledger(&cause.to_string());
        self.transition(ManeuverState::Emergency, "emergency raised");
    }

    pub(crate) fn mission_flag(&self) -> Result<MissionFlag<'_>, ManeuverError> {
        if self.mission_active.swap(true, Ordering::SeqCst) {
            return Err(ManeuverError::Rejected("a mission or hold is already running".into()));
        }
        Ok(MissionFlag(&self.mission_active))
    }

    pub(crate) fn require_ready(&self, require_armable: bool, emergency_override: bool) -> Result<Vec<String>, ManeuverError> {
        let snap = self.snapshot();
        Ok(self.gate.check(&snap, require_armable, emergency_override)?)
    }

    fn send(&self, what: &str, res: anyhow::Result<()>) -> Result<(), ManeuverError> {
        res.map_err(|e| {
            error!(event = "link_command_failed", command = what, error = %format!("{:#}", e));
            ManeuverError::Link(e)
        })
    }

    /// Command a mode and wait until telemetry reports it.
    pub(crate) async fn set_mode_confirmed(&self, mode: FlightMode, timeout: Duration) -> Result<(), ManeuverError> {
        *lock(&self.commanded_mode) = Some(mode);
        if self.snapshot().is_mode(mode) {
            return Ok(());
        }
        self.send("set_mode", self.link.set_mode(mode))?;
        let poll = secs(self.timeouts.poll_s);
        wait_for(timeout, poll, || self.snapshot().is_mode(mode))
            .await
            .map_err(|e| ManeuverError::waiting(format!("mode {}", mode), e))?;
        debug!(event = "mode_confirmed", mode = %mode);
        Ok(())
    }

    /// Best-effort mode request without confirmation.
    pub(crate) fn request_mode(&self, mode: FlightMode) -> Result<(), ManeuverError> {
        *lock(&self.commanded_mode) = Some(mode);
        self.send("set_mode", self.link.set_mode(mode))
    }

    fn check_throttle_safe(&self) -> Result<(), ManeuverError> {
        match self.snapshot().throttle_pwm {
            Some(pwm) if pwm > self.thresholds.safe_throttle_pwm => Err(ManeuverError::Rejected(format!(
                "throttle at {} PWM, must be at or below {} to arm",
                pwm, self.thresholds.safe_throttle_pwm
            ))),
            Some(_) => Ok(()),
            None => {
                debug!("no RC throttle telemetry, skipping throttle check");
                Ok(())
            }
        }
    }

    pub async fn arm(&self) -> Result<(), ManeuverError> {
        self.require_ready(true, false)?;
        self.set_mode_confirmed(FlightMode::Guided, secs(self.timeouts.mode_s)).await?;
        if self.snapshot().armed {
            self.transition(ManeuverState::Armed, "already armed");
            return Ok(());
        }
        self.check_throttle_safe()?;

        self.emergency_descent.store(false, Ordering::SeqCst);
        self.send("arm", self.link.set_armed(true))?;
        wait_for(secs(self.timeouts.arm_s), secs(self.timeouts.poll_s), || self.snapshot().armed)
            .await
            .map_err(|e| ManeuverError::waiting("arming", e))?;
        info!(event = "armed", link = %self.link.describe());
        self.transition(ManeuverState::Armed, "arm confirmed");
        Ok(())
    }

    pub async fn disarm(&self) -> Result<(), ManeuverError> {
        let snap = self.snapshot();
        if !snap.armed {
            self.transition(ManeuverState::Disarmed, "already disarmed");
            return Ok(());
        }
        if let Some(alt) = snap.altitude() {
            if alt > self.thresholds.airborne_altitude_m {
                return Err(ManeuverError::Rejected(format!("refusing to disarm at {:.1}m, land first", alt)));
            }
        }
        self.send("disarm", self.link.set_armed(false))?;
        wait_for(secs(self.timeouts.disarm_s), secs(self.timeouts.poll_s), || !self.snapshot().armed)
            .await
            .map_err(|e| ManeuverError::waiting("disarm", e))?;
        self.transition(ManeuverState::Disarmed, "disarm confirmed");
        Ok(())
    }

    pub async fn arm_and_takeoff(&self, altitude_m: f64, mission_id: Option<&str>) -> Result<(), ManeuverError> {
        self.thresholds.check_altitude(altitude_m).map_err(ManeuverError::Rejected)?;
        self.arm().await?;
        sleep(secs(self.timeouts.arm_settle_s)).await;
        if let Err(e) = self.takeoff(altitude_m, mission_id).await {
            let on_ground = self.snapshot().altitude().map_or(true, |a| a < self.thresholds.on_ground_altitude_m);
            if on_ground {
                warn!(event = "takeoff_failed_disarming", error = %e);
                if let Err(d) = self.disarm().await {
                    warn!(event = "disarm_after_failed_takeoff", error = %d);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Checks that only matter once the props are spinning: position
    /// integrity and voltage under load.
    fn check_takeoff_integrity(&self, snap: &VehicleSnapshot) -> Result<(), ManeuverError> {
        let t = &self.thresholds;
        if let Some(eph) = snap.eph() {
            let max = t.max_eph_for(self.profile);
            if eph > max {
                return Err(ManeuverError::Rejected(format!("GPS accuracy too poor for takeoff: HDOP {:.2} > {:.2}", eph, max)));
            }
        }
        if let Some(gs) = snap.groundspeed_mps {
            let max = t.max_groundspeed_for(self.profile);
            if gs > max {
                return Err(ManeuverError::Rejected(format!(
                    "implausible ground speed {:.1} m/s on the ground, possible GPS fault",
                    gs
                )));
            }
        }
        if let Some(v) = snap.battery.voltage.filter(|v| *v > 0.0) {
            let min = t.min_voltage_for(v) + t.takeoff_voltage_margin;
            if v < min {
                return Err(GateFailure::VoltageLow { voltage: v, min }.into());
            }
        }
        if snap.valid_home().is_none() {
            warn!(event = "takeoff_without_home", "home position not set, RTL will fall back to landing in place");
        }
        Ok(())
    }

    pub async fn takeoff(&self, altitude_m: f64, mission_id: Option<&str>) -> Result<(), ManeuverError> {
        self.thresholds.check_altitude(altitude_m).map_err(ManeuverError::Rejected)?;
        let snap = self.snapshot();
        if !snap.armed {
            return Err(ManeuverError::Rejected("vehicle is not armed".into()));
        }
        if !snap.is_mode(FlightMode::Guided) {
            return Err(ManeuverError::Rejected(format!(
                "vehicle must be in GUIDED for takeoff, not {}",
                snap.mode.map_or_else(|| "unknown".to_string(), |m| m.to_string())
            )));
        }
        self.require_ready(false, false)?;
        self.check_takeoff_integrity(&snap)?;

        let watch = self.signals.watch();
        let progress = |stage: TakeoffStage, alt: Option<f64>| {
            self.sink.publish(FlightEvent::TakeoffProgress {
                mission_id: mission_id.map(str::to_string),
                stage,
                altitude_m: alt,
                target_altitude_m: altitude_m,
            });
        };

        info!(event = "takeoff", target_m = altitude_m);
        progress(TakeoffStage::Started, snap.altitude());
        self.send("takeoff", self.link.command_takeoff(altitude_m))?;
        self.transition(ManeuverState::Airborne, "takeoff commanded");

        let target = altitude_m * 0.95;
        let mut last_meter = snap.altitude().unwrap_or(0.0).floor() as i64;
        let res = wait_for_unless_emergency(secs(self.timeouts.takeoff_s), secs(self.timeouts.takeoff_poll_s), &watch, || {
            let alt = self.snapshot().altitude();
            if let Some(a) = alt {
                let meter = a.floor() as i64;
                if meter > last_meter {
                    last_meter = meter;
                    debug!(event = "climbing", altitude_m = a);
                    progress(TakeoffStage::Climbing, alt);
                }
            }
            alt.is_some_and(|a| a >= target)
        })
        .await;

        match res {
            Ok(()) => {
                let alt = self.snapshot().altitude();
                info!(event = "takeoff_complete", altitude_m = ?alt);
                progress(TakeoffStage::Complete, alt);
                Ok(())
            }
            Err(e) => {
                let alt = self.snapshot().altitude();
                error!(event = "takeoff_failed", altitude_m = ?alt, target_m = altitude_m);
                progress(TakeoffStage::Failed, alt);
                Err(ManeuverError::waiting(format!("climb to {:.1}m", altitude_m), e))
            }
        }
    }

    pub async fn land(&self, opts: LandOptions) -> Result<Landing, ManeuverError> {
        let snap = self.snapshot();
        if snap.altitude().is_some_and(|a| a < self.thresholds.on_ground_altitude_m) && !snap.armed {
            return Ok(Landing::AlreadyOnGround);
        }
        if !opts.force_here {
            return self.rtl(opts.emergency_override).await;
        }
        if !opts.emergency_override {
            // descending never makes a low battery worse
            self.require_ready(false, true)?;
        }
        let (mode_timeout, land_timeout) = if opts.emergency_override {
            (self.timeouts.emergency_mode_s, self.timeouts.emergency_land_s)
        } else {
            (self.timeouts.mode_s, self.timeouts.land_s)
        };
        let watch = self.signals.watch();
        self.land_here(secs(mode_timeout), secs(land_timeout), (!opts.emergency_override).then_some(&watch))
            .await?;
        Ok(Landing::Here)
    }

    pub async fn rtl(&self, emergency_override: bool) -> Result<Landing, ManeuverError> {
        let timeout = if emergency_override {
            self.timeouts.emergency_rtl_s.max(self.timeouts.rtl_s)
        } else {
            self.timeouts.rtl_s
        };
        self.rtl_within(emergency_override, secs(timeout)).await
    }

    /// RTL waiting at most `timeout` for the vehicle to disarm at home.
    pub async fn rtl_within(&self, emergency_override: bool, timeout: Duration) -> Result<Landing, ManeuverError> {
        let snap = self.snapshot();
        if snap.valid_home().is_none() {
            warn!(event = "rtl_substituted", home = ?snap.home, "home unset or invalid, landing instead");
            let report = self.emergency_land().await;
            return match report.succeeded() {
                Some(_) => Ok(Landing::Escalated { report }),
                None => Err(ManeuverError::EscalationFailed(report)),
            };
        }
        if !emergency_override {
            self.require_ready(false, true)?;
        }
        let mode_timeout = if emergency_override { self.timeouts.emergency_mode_s } else { self.timeouts.mode_s };
        let watch = self.signals.watch();
        self.return_home(secs(mode_timeout), timeout, (!emergency_override).then_some(&watch))
            .await?;
        Ok(Landing::AtHome)
    }

    async fn land_here(&self, mode_timeout: Duration, timeout: Duration, watch: Option<&SignalWatch>) -> Result<(), ManeuverError> {
        self.set_mode_confirmed(FlightMode::Land, mode_timeout).await?;
        self.transition(ManeuverState::Landing, "LAND engaged");
        let touchdown = self.thresholds.touchdown_altitude_m;
        let mut last_logged = f64::MAX;
        let cond = || {
            let s = self.snapshot();
            if let Some(a) = s.altitude() {
                if last_logged - a >= 2.0 {
                    last_logged = a;
                    info!(event = "descending", altitude_m = a);
                }
            }
            !s.armed && s.altitude().map_or(true, |a| a < touchdown)
        };
        let poll = secs(self.timeouts.land_poll_s);
        let res = match watch {
            Some(w) => wait_for_unless_emergency(timeout, poll, w, cond).await,
            None => wait_for(timeout, poll, cond).await,
        };
        res.map_err(|e| ManeuverError::waiting("touchdown", e))?;
        info!(event = "landed");
        self.transition(ManeuverState::Disarmed, "landed");
        Ok(())
    }

    async fn return_home(&self, mode_timeout: Duration, timeout: Duration, watch: Option<&SignalWatch>) -> Result<(), ManeuverError> {
        self.set_mode_confirmed(FlightMode::Rtl, mode_timeout).await?;
        self.transition(ManeuverState::Returning, "RTL engaged");
        let mut last_log: Option<Instant> = None;
        let cond = || {
            let s = self.snapshot();
            if last_log.map_or(true, |t| t.elapsed() >= Duration::from_secs(10)) {
                last_log = Some(Instant::now());
                info!(event = "returning", distance_to_home_m = ?s.distance_to_home(), altitude_m = ?s.altitude());
            }
            !s.armed
        };
        let poll = secs(self.timeouts.rtl_poll_s);
        let res = match watch {
            Some(w) => wait_for_unless_emergency(timeout, poll, w, cond).await,
            None => wait_for(timeout, poll, cond).await,
        };
        res.map_err(|e| ManeuverError::waiting("return to launch", e))?;
        info!(event = "rtl_complete");
        self.transition(ManeuverState::Disarmed, "landed at home");
        Ok(())
    }

    fn throttle_cut(&self, report: &mut EscalationReport) {
        match self.link.override_throttle(Some(PWM_MIN)) {
            Ok(()) => report.push(FallbackStep::ThrottleCut, true, false, "throttle forced to minimum"),
            Err(e) => {
                error!(event = "throttle_cut_failed", error = %format!("{:#}", e));
                report.push(FallbackStep::ThrottleCut, false, false, format!("{:#}", e));
            }
        }
    }

    /// Escalating landing: RTL when home is usable, otherwise or on failure
    /// land here, and only when even LAND cannot be engaged cut throttle.
    pub async fn emergency_land(&self) -> EscalationReport {
        let _guard = self.emergency_guard();
        self.clear_ledger("emergency_land");
        self.transition(ManeuverState::Emergency, "emergency landing");
        let mut report = EscalationReport::default();
        let mode_timeout = secs(self.timeouts.emergency_mode_s);

        if self.snapshot().valid_home().is_some() {
            match self.return_home(mode_timeout, secs(self.timeouts.emergency_rtl_s), None).await {
                Ok(()) => {
                    report.push(FallbackStep::ReturnToLaunch, true, true, "landed at home");
                    return report;
                }
                Err(e) => {
                    let engaged = self.snapshot().is_mode(FlightMode::Rtl);
                    report.push(FallbackStep::ReturnToLaunch, engaged, false, e.to_string());
                }
            }
        } else {
            report.push(FallbackStep::ReturnToLaunch, false, false, "home unset or invalid");
        }

        match self.land_here(mode_timeout, secs(self.timeouts.emergency_land_s), None).await {
            Ok(()) => report.push(FallbackStep::LandHere, true, true, "landed in place"),
            Err(e) => {
                let engaged = self.snapshot().is_mode(FlightMode::Land);
                report.push(FallbackStep::LandHere, engaged, false, e.to_string());
                if !engaged {
                    self.throttle_cut(&mut report);
                }
            }
        }
        if !self.snapshot().armed {
            self.transition(ManeuverState::Disarmed, "emergency landing finished");
        }
        report
    }

    /// LAND at the current position right now; throttle cut if the mode
    /// change is refused.
    pub async fn force_land_here(&self) -> EscalationReport {
        let _guard = self.emergency_guard();
        self.clear_ledger("force_land_here");
        self.transition(ManeuverState::Emergency, "forced landing");
        let mut report = EscalationReport::default();
        match self.set_mode_confirmed(FlightMode::Land, secs(self.timeouts.force_land_mode_s)).await {
            Ok(()) => {
                self.transition(ManeuverState::Landing, "LAND engaged");
                report.push(FallbackStep::LandHere, true, false, "LAND engaged, descending");
            }
            Err(e) => {
                report.push(FallbackStep::LandHere, false, false, e.to_string());
                self.throttle_cut(&mut report);
            }
        }
        report
    }

    pub async fn emergency_disarm(&self, confirm: bool) -> Result<DisarmOutcome, ManeuverError> {
        if !confirm {
            return Err(ManeuverError::Rejected("emergency disarm requires confirm=true".into()));
        }
        let snap = self.snapshot();
        if !snap.armed {
            return Ok(DisarmOutcome::AlreadyDisarmed);
        }
        if let Some(alt) = snap.altitude() {
            if alt > self.thresholds.airborne_altitude_m {
                warn!(event = "emergency_disarm_substituted", altitude_m = alt, "too high to cut motors, landing instead");
                return Ok(DisarmOutcome::Escalated { report: self.emergency_land().await });
            }
        }
        let _guard = self.emergency_guard();
        self.clear_ledger("emergency_disarm");
        warn!(event = "emergency_disarm", altitude_m = ?snap.altitude());
        self.send("throttle", self.link.override_throttle(Some(PWM_MIN)))?;
        self.send("disarm", self.link.set_armed(false))?;
        let res = wait_for(secs(self.timeouts.emergency_disarm_s), secs(self.timeouts.poll_s), || !self.snapshot().armed).await;
        if let Err(e) = self.link.override_throttle(None) {
            warn!(event = "throttle_release_failed", error = %format!("{:#}", e));
        }
        res.map_err(|e| ManeuverError::waiting("emergency disarm", e))?;
        self.transition(ManeuverState::Disarmed, "emergency disarm");
        Ok(DisarmOutcome::Disarmed)
    }

    /// Override the throttle channel; returns the PWM sent.
    pub async fn set_throttle(&self, percent: f64) -> Result<u16, ManeuverError> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(ManeuverError::Rejected(format!("throttle {}% outside 0-100", percent)));
        }
        let pwm = throttle_pwm(percent);
        self.send("throttle", self.link.override_throttle(Some(pwm)))?;
        if self.snapshot().throttle_pwm.is_some() {
            wait_for(secs(self.timeouts.throttle_verify_s), secs(self.timeouts.poll_s), || {
                self.snapshot().throttle_pwm.is_some_and(|p| p.abs_diff(pwm) <= 10)
            })
            .await
            .map_err(|e| ManeuverError::waiting(format!("throttle {} PWM", pwm), e))?;
        }
        info!(event = "throttle_override", percent, pwm);
        Ok(pwm)
    }

    pub fn release_throttle(&self) -> Result<(), ManeuverError> {
        self.send("throttle", self.link.override_throttle(None))?;
        info!(event = "throttle_released");
        Ok(())
    }

    pub fn manual_override(&self, engaged: bool) -> Result<(), ManeuverError> {
        if engaged {
            self.signals.engage_override();
            self.request_mode(FlightMode::Loiter)?;
        } else {
            self.signals.release_override();
        }
        Ok(())
    }

    /// Prompt the operator and carry out whatever comes back.
    pub async fn handle_battery_emergency(&self) -> EmergencyOutcome {
        let _guard = self.emergency_guard();
        let snap = self.snapshot();
        self.transition(ManeuverState::Emergency, "battery emergency");
        let negotiation = self.desk.negotiate(EmergencyContext::from_snapshot(&snap)).await;

        let res = match negotiation.resolution {
            EmergencyResolution::OperatorLand => self.land(LandOptions { force_here: true, emergency_override: true }).await,
            EmergencyResolution::OperatorRtl | EmergencyResolution::TimeoutRtl => self.rtl(true).await,
        };
        let (maneuver_ok, detail) = match &res {
            Ok(l) => (true, l.describe()),
            Err(e) => (false, e.to_string()),
        };
        if maneuver_ok {
            info!(event = "battery_emergency_handled", resolution = ?negotiation.resolution, detail = %detail);
        } else {
            error!(event = "battery_emergency_failed", resolution = ?negotiation.resolution, detail = %detail);
        }
        self.sink.publish(FlightEvent::EmergencyAction {
            prompt_id: negotiation.prompt_id.clone(),
            resolution: negotiation.resolution,
            maneuver_ok,
        });
        EmergencyOutcome { negotiation, maneuver_ok, detail }
    }

    /// Take off, hold for `duration_s`, then come home.
    pub async fn timed_hold(&self, altitude_m: f64, duration_s: f64) -> Result<HoldOutcome, ManeuverError> {
        self.thresholds.check_altitude(altitude_m).map_err(ManeuverError::Rejected)?;
        self.thresholds.check_flight_time(duration_s).map_err(ManeuverError::Rejected)?;
        if !self.snapshot().armed {
            return Err(ManeuverError::Rejected("vehicle must be armed before a timed hold".into()));
        }
        let _flag = self.mission_flag()?;
        let watch = self.signals.watch();
        self.takeoff(altitude_m, None).await?;

        let duration = secs(duration_s);
        let started = Instant::now();
        *lock(&self.hold) = Some(HoldClock { started, altitude_m, duration });
        self.transition(ManeuverState::Holding, "hold started");
        info!(event = "hold_started", altitude_m, duration_s);

        let outcome = loop {
            let held_s = started.elapsed().as_secs_f64();
            match watch.interruption() {
                Some(Interruption::Override) => break Some(HoldOutcome::Overridden { held_s }),
                Some(Interruption::Emergency(c)) => break Some(HoldOutcome::Interrupted { cause: c.to_string(), held_s }),
                None => {}
            }
            if let Some(b) = self.snapshot().battery_percent() {
                if b < self.thresholds.critical_battery_percent {
                    warn!(event = "hold_battery_critical", battery = b);
                    break Some(HoldOutcome::BatteryEmergency { emergency: self.handle_battery_emergency().await });
                }
            }
            if started.elapsed() >= duration {
                break None;
            }
            sleep(secs(self.timeouts.hold_poll_s).min(duration.saturating_sub(started.elapsed()))).await;
        };
        *lock(&self.hold) = None;
        if let Some(o) = outcome {
            warn!(event = "hold_ended_early", outcome = ?o);
            return Ok(o);
        }

        info!(event = "hold_complete", held_s = started.elapsed().as_secs_f64());
        let landing = match self.rtl(false).await {
            Ok(l) => l,
            Err(e) => {
                warn!(event = "hold_rtl_failed", error = %e, "landing in place instead");
                self.land(LandOptions { force_here: true, emergency_override: true }).await?
            }
        };
        Ok(HoldOutcome::Completed { landing })
    }

    /// Home position with the checks that make it trustworthy for RTL.
    pub fn verify_home(&self) -> Result<GeoPoint, String> {
        let snap = self.snapshot();
        let home = snap.home.ok_or("home position not set")?;
        if !home.is_valid() {
            return Err(format!("home ({:.6}, {:.6}) out of range", home.lat, home.lon));
        }
        if home.is_null_island() {
            return Err("home is at (0, 0), GPS had no fix when it was recorded".to_string());
        }
        if let Some(eph) = snap.eph() {
            if eph > self.thresholds.home_max_eph {
                return Err(format!("GPS accuracy too poor to trust home: HDOP {:.2}", eph));
            }
        }
        Ok(home)
    }

    pub fn home_distance(&self) -> Option<f64> {
        self.snapshot().distance_to_home()
    }
}

pub const PWM_MIN: u16 = 1000;

/// 0-100 % to 1000-2000 µs.
pub fn throttle_pwm(percent: f64) -> u16 {
    PWM_MIN + (percent.clamp(0.0, 100.0) * 10.0).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_mapping() {
        assert_eq!(throttle_pwm(0.0), 1000);
        assert_eq!(throttle_pwm(42.5), 1425);
        assert_eq!(throttle_pwm(100.0), 2000);
    }

    #[test]
    fn escalation_reports_last_engaged_step() {
        let mut r = EscalationReport::default();
        assert_eq!(r.succeeded(), None);
        r.push(FallbackStep::ReturnToLaunch, false, false, "home invalid");
        r.push(FallbackStep::LandHere, true, false, "timed out");
        assert_eq!(r.succeeded(), Some(FallbackStep::LandHere));
    }

    #[test]
    fn timeouts_validate() {
        assert!(ManeuverTimeouts::default().validate().is_ok());
        let t = ManeuverTimeouts { land_s: 0.0, ..Default::default() };
        assert!(t.validate().is_err());
    }
}
