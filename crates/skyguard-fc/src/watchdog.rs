//! Background safety loops. Each runs as its own task for the life of the
//! session and acts through the controller, so its maneuvers go through
//! the same state machine as operator commands.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use skyguard_proto::FlightEvent;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::controller::{secs, Controller, ManeuverState};
use crate::report::detect_anomalies;
use crate::signals::EmergencyCause;
use crate::state::{FlightMode, VehicleSnapshot};
use crate::wait::wait_for;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub heartbeat_interval_s: f64,
    pub heartbeat_stale_s: f64,
    pub heartbeat_misses: u32,
    pub failsafe_interval_s: f64,
    pub gps_recovery_timeout_s: f64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_s: 1.0,
            heartbeat_stale_s: 3.0,
            heartbeat_misses: 3,
            failsafe_interval_s: 2.0,
            gps_recovery_timeout_s: 15.0,
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.heartbeat_interval_s > 0.0, "watchdog.heartbeat_interval_s must be positive");
        anyhow::ensure!(self.failsafe_interval_s > 0.0, "watchdog.failsafe_interval_s must be positive");
        anyhow::ensure!(self.heartbeat_misses > 0, "watchdog.heartbeat_misses must be at least 1");
        anyhow::ensure!(self.gps_recovery_timeout_s > 0.0, "watchdog.gps_recovery_timeout_s must be positive");
        Ok(())
    }
}

fn failsafe_event(c: &Controller, trigger: &str, action: &str, detail: String) {
    error!(event = "failsafe", trigger, action, detail = %detail);
    c.sink().publish(FlightEvent::Failsafe { trigger: trigger.to_string(), action: action.to_string(), detail });
}

/// Counts consecutive stale heartbeat samples; three in a row is a lost link.
pub fn spawn_heartbeat(controller: Arc<Controller>, cfg: WatchdogConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stale_after = secs(cfg.heartbeat_stale_s);
        let mut misses = 0u32;
        info!(event = "watchdog_started", watchdog = "heartbeat");
        loop {
            sleep(secs(cfg.heartbeat_interval_s)).await;
            let snap = controller.snapshot();
            let stale = !snap.connected || snap.heartbeat_age.map_or(true, |a| a > stale_after);
            if !stale {
                if misses > 0 {
                    info!(event = "heartbeat_recovered", after_misses = misses);
                }
                misses = 0;
                continue;
            }
            misses += 1;
            warn!(event = "heartbeat_stale", misses, age_s = ?snap.heartbeat_age.map(|a| a.as_secs_f64()));
            if misses < cfg.heartbeat_misses {
                continue;
            }
            misses = 0;
            if !snap.armed {
                warn!(event = "connection_lost_on_ground", "link lost while disarmed, no action");
                continue;
            }
            if controller.in_emergency() {
                warn!(event = "connection_lost_in_emergency", "emergency maneuver already under way, not preempting");
                continue;
            }
            failsafe_event(&controller, "connection_loss", "emergency_land", format!("{} stale heartbeats", cfg.heartbeat_misses));
            controller.raise_emergency(EmergencyCause::ConnectionLoss);
            let report = controller.emergency_land().await;
            info!(event = "connection_loss_handled", succeeded = ?report.succeeded());
        }
    })
}

/// Battery, GPS, mode and anomaly checks on a slower cadence.
pub fn spawn_failsafe(controller: Arc<Controller>, cfg: WatchdogConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut prev: Option<VehicleSnapshot> = None;
        info!(event = "watchdog_started", watchdog = "failsafe");
        loop {
            sleep(secs(cfg.failsafe_interval_s)).await;
            let snap = controller.snapshot();
            if let Some(p) = &prev {
                for a in detect_anomalies(p, &snap) {
                    warn!(event = "telemetry_anomaly", anomaly = ?a);
                }
            }
            prev = Some(snap.clone());

            if !snap.armed || controller.in_emergency() {
                continue;
            }
            failsafe_tick(&controller, &cfg, &snap).await;
        }
    })
}

async fn failsafe_tick(c: &Controller, cfg: &WatchdogConfig, snap: &VehicleSnapshot) {
    let t = c.thresholds();

    if let Some(b) = snap.battery_percent() {
        if b < t.failsafe_battery_percent {
            failsafe_event(c, "low_battery", "rtl", format!("battery {}% below {}%", b, t.failsafe_battery_percent));
            let _guard = c.emergency_guard();
            c.raise_emergency(EmergencyCause::LowBattery);
            match c.rtl(true).await {
                Ok(l) => info!(event = "low_battery_handled", detail = %l.describe()),
                Err(e) => error!(event = "low_battery_rtl_failed", error = %e),
            }
            return;
        }
    }

    if snap.gps_fix().map_or(true, |f| f < t.min_gps_fix) {
        gps_hold_and_recover(c, cfg, snap).await;
        return;
    }

    if c.mission_active() && !c.signals().override_engaged() {
        if let (Some(want), Some(have)) = (c.commanded_mode(), snap.mode) {
            if want != have {
                warn!(event = "mode_reasserted", expected = %want, observed = %have);
                if let Err(e) = c.link().set_mode(want) {
                    error!(event = "mode_reassert_failed", error = %format!("{:#}", e));
                }
            }
        }
    }
}

/// Hold altitude without GPS and wait for the fix to come back; land if it
/// does not.
async fn gps_hold_and_recover(c: &Controller, cfg: &WatchdogConfig, snap: &VehicleSnapshot) {
    let t = c.thresholds();
    let resume = c.commanded_mode().filter(|m| *m != FlightMode::AltHold);
    failsafe_event(c, "gps_loss", "alt_hold", format!("fix {:?} below {}", snap.gps_fix(), t.min_gps_fix));
    if let Err(e) = c.link().set_mode(FlightMode::AltHold) {
        error!(event = "alt_hold_failed", error = %format!("{:#}", e));
    }

    let started = Instant::now();
    let recovered = wait_for(secs(cfg.gps_recovery_timeout_s), Duration::from_secs(1), || {
        c.in_emergency() || c.snapshot().gps_fix().is_some_and(|f| f >= t.min_gps_fix)
    })
    .await;

    if c.in_emergency() {
        info!(event = "gps_wait_preempted", "emergency maneuver took over during GPS wait");
        return;
    }
    match recovered {
        Ok(()) => {
            info!(event = "gps_recovered", after_s = started.elapsed().as_secs_f64());
            if let Some(mode) = resume {
                if c.mission_active() && !c.signals().override_engaged() && mode == FlightMode::Guided {
                    if let Err(e) = c.link().set_mode(mode) {
                        error!(event = "mode_restore_failed", error = %format!("{:#}", e));
                    }
                    return;
                }
            }
            debug!("gps recovered, staying in ALT_HOLD");
        }
        Err(_) => {
            failsafe_event(c, "gps_loss", "emergency_land", format!("no fix after {:.0}s", cfg.gps_recovery_timeout_s));
            c.raise_emergency(EmergencyCause::GpsLoss);
            let report = c.emergency_land().await;
            if c.state() != ManeuverState::Disarmed {
                warn!(event = "gps_loss_landing_incomplete", succeeded = ?report.succeeded());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(WatchdogConfig::default().validate().is_ok());
        let c = WatchdogConfig { heartbeat_misses: 0, ..Default::default() };
        assert!(c.validate().is_err());
    }
}
