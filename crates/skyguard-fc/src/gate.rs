//! Readiness gate: turns a telemetry snapshot plus the safety thresholds
//! into a go/no-go answer for arming and for general commands.
//!
//! Checks run in a fixed order and stop at the first failure:
//! link freshness, armable, GPS, battery, system status. An emergency
//! override only suppresses the battery class; a stale link is never
//! waived.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::safety::SafetyThresholds;
use crate::state::{SystemStatus, VehicleSnapshot};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GateFailure {
    #[error("vehicle link not connected")]
    NotConnected,
    #[error("no heartbeat received from vehicle")]
    NoHeartbeat,
    #[error("heartbeat stale: {age_s:.1}s old (max {max_s:.1}s)")]
    StaleHeartbeat { age_s: f64, max_s: f64 },
    #[error("vehicle reports not armable")]
    NotArmable,
    #[error("no GPS telemetry")]
    NoGps,
    #[error("GPS fix {fix} below required {required}")]
    GpsFix { fix: u8, required: u8 },
    #[error("{satellites} satellites below required {required}")]
    Satellites { satellites: u8, required: u8 },
    #[error("battery {percent}% below minimum {min}%")]
    BatteryLow { percent: u8, min: u8 },
    #[error("battery {voltage:.2}V below minimum {min:.2}V")]
    VoltageLow { voltage: f32, min: f32 },
    #[error("system status {0:?} is not safe to command")]
    SystemStatus(SystemStatus),
}

impl GateFailure {
    pub fn check_name(&self) -> &'static str {
        match self {
            GateFailure::NotConnected | GateFailure::NoHeartbeat | GateFailure::StaleHeartbeat { .. } => "link",
            GateFailure::NotArmable => "armable",
            GateFailure::NoGps | GateFailure::GpsFix { .. } | GateFailure::Satellites { .. } => "gps",
            GateFailure::BatteryLow { .. } | GateFailure::VoltageLow { .. } => "battery",
            GateFailure::SystemStatus(_) => "system_status",
        }
    }
}

/// Boolean verdict plus human-readable reasons. On failure the first reason
/// is the failing check; notes about skipped checks follow.
#[derive(Debug, Clone, PartialEq)]
pub struct Readiness {
    pub ready: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReadinessGate {
    thresholds: Arc<SafetyThresholds>,
}

impl ReadinessGate {
    pub fn new(thresholds: Arc<SafetyThresholds>) -> Self {
        Self { thresholds }
    }

    pub fn is_ready(&self, snap: &VehicleSnapshot, require_armable: bool, emergency_override: bool) -> Readiness {
        let mut notes = Vec::new();
        match self.evaluate(snap, require_armable, emergency_override, &mut notes) {
            Ok(()) => {
                info!(event = "readiness", ready = true, require_armable, emergency_override);
                Readiness { ready: true, reasons: notes }
            }
            Err(f) => {
                warn!(event = "readiness", ready = false, check = f.check_name(), reason = %f, require_armable, emergency_override);
                let mut reasons = vec![f.to_string()];
                reasons.extend(notes);
                Readiness { ready: false, reasons }
            }
        }
    }

    /// Same checks as [`is_ready`](Self::is_ready) but keeps the typed failure.
    pub fn check(&self, snap: &VehicleSnapshot, require_armable: bool, emergency_override: bool) -> Result<Vec<String>, GateFailure> {
        let mut notes = Vec::new();
        self.evaluate(snap, require_armable, emergency_override, &mut notes)?;
        Ok(notes)
    }

    fn evaluate(
        &self,
        snap: &VehicleSnapshot,
        require_armable: bool,
        emergency_override: bool,
        notes: &mut Vec<String>,
    ) -> Result<(), GateFailure> {
        let t = &self.thresholds;

        // 1. link
        if !snap.connected {
            return Err(GateFailure::NotConnected);
        }
        let age = snap.heartbeat_age.ok_or(GateFailure::NoHeartbeat)?;
        let max = t.max_heartbeat_age();
        if age > max {
            return Err(GateFailure::StaleHeartbeat { age_s: age.as_secs_f64(), max_s: max.as_secs_f64() });
        }
        debug!(event = "gate_check", check = "link", ok = true);

        // 2. armable
        if require_armable && snap.armable != Some(true) {
            return Err(GateFailure::NotArmable);
        }

        // 3. gps
        match snap.gps {
            None if require_armable => return Err(GateFailure::NoGps),
            None => notes.push("GPS telemetry unavailable; fix not verified".to_string()),
            Some(gps) => {
                let required = if require_armable { t.min_gps_fix } else { t.command_gps_fix };
                if gps.fix_type < required {
                    return Err(GateFailure::GpsFix { fix: gps.fix_type, required });
                }
                if require_armable {
                    let satellites = gps.satellites.unwrap_or(0);
                    if satellites < t.min_satellites {
                        return Err(GateFailure::Satellites { satellites, required: t.min_satellites });
                    }
                }
            }
        }
        debug!(event = "gate_check", check = "gps", ok = true);

        // 4. battery
        if emergency_override {
            notes.push("emergency override: battery checks skipped".to_string());
        } else {
            if let Some(percent) = snap.battery.remaining {
                if percent < t.min_battery_percent {
                    return Err(GateFailure::BatteryLow { percent, min: t.min_battery_percent });
                }
            }
            match snap.battery.voltage {
                Some(voltage) if voltage > 0.0 => {
                    let min = t.min_voltage_for(voltage);
                    if voltage < min {
                        return Err(GateFailure::VoltageLow { voltage, min });
                    }
                }
                _ => notes.push("battery voltage unavailable".to_string()),
            }
            debug!(event = "gate_check", check = "battery", ok = true);
        }

        // 5. system status
        if let Some(status) = snap.system_status {
            let ok = if require_armable { status.is_armable_state() } else { status.accepts_commands() };
            if !ok {
                return Err(GateFailure::SystemStatus(status));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state::{BatteryStatus, GpsStatus, Position};

    fn gate() -> ReadinessGate {
        ReadinessGate::new(Arc::new(SafetyThresholds::default()))
    }

    fn healthy() -> VehicleSnapshot {
        VehicleSnapshot {
            connected: true,
            position: Some(Position { lat: 47.0, lon: 8.0, alt_rel_m: 0.0, alt_msl_m: Some(410.0) }),
            battery: BatteryStatus { voltage: Some(12.6), current: Some(0.4), remaining: Some(90) },
            gps: Some(GpsStatus { fix_type: 3, satellites: Some(12), eph: Some(0.9) }),
            armable: Some(true),
            heartbeat_age: Some(Duration::from_millis(300)),
            system_status: Some(SystemStatus::Standby),
            ..Default::default()
        }
    }

    #[test]
    fn healthy_snapshot_passes_for_arming() {
        let r = gate().is_ready(&healthy(), true, false);
        assert!(r.ready, "{:?}", r.reasons);
    }

    #[test]
    fn stale_heartbeat_is_never_overridden() {
        let mut s = healthy();
        s.heartbeat_age = Some(Duration::from_secs(6));
        let err = gate().check(&s, false, true).unwrap_err();
        assert!(matches!(err, GateFailure::StaleHeartbeat { .. }));

        s.connected = false;
        assert_eq!(gate().check(&s, false, true).unwrap_err(), GateFailure::NotConnected);
    }

    #[test]
    fn connected_without_heartbeat_is_not_ready() {
        let mut s = healthy();
        s.heartbeat_age = None;
        assert_eq!(gate().check(&s, false, false).unwrap_err(), GateFailure::NoHeartbeat);
        assert_eq!(gate().check(&s, false, true).unwrap_err(), GateFailure::NoHeartbeat);
        let r = gate().is_ready(&s, true, true);
        assert!(!r.ready);
        assert_eq!(r.reasons[0], "no heartbeat received from vehicle");
        assert_eq!(GateFailure::NoHeartbeat.check_name(), "link");
    }

    #[test]
    fn gps_floor_differs_for_arming_and_commands() {
        let mut s = healthy();
        s.gps = Some(GpsStatus { fix_type: 2, satellites: Some(4), eph: None });
        assert_eq!(gate().check(&s, true, false).unwrap_err(), GateFailure::GpsFix { fix: 2, required: 3 });
        assert!(gate().check(&s, false, false).is_ok());

        s.gps = Some(GpsStatus { fix_type: 3, satellites: Some(4), eph: None });
        assert_eq!(gate().check(&s, true, false).unwrap_err(), GateFailure::Satellites { satellites: 4, required: 6 });
    }

    #[test]
    fn missing_gps_blocks_arming_only() {
        let mut s = healthy();
        s.gps = None;
        assert_eq!(gate().check(&s, true, false).unwrap_err(), GateFailure::NoGps);
        let notes = gate().check(&s, false, false).unwrap();
        assert!(notes[0].contains("GPS telemetry unavailable"));
    }

    #[test]
    fn override_only_suppresses_battery() {
        let mut s = healthy();
        s.battery.remaining = Some(12);
        let r = gate().is_ready(&s, true, false);
        assert!(!r.ready);
        assert!(r.reasons[0].contains("battery 12%"));
        assert!(gate().is_ready(&s, true, true).ready);

        // other failing checks still fail with override
        s.armable = Some(false);
        assert_eq!(gate().check(&s, true, true).unwrap_err(), GateFailure::NotArmable);
    }

    #[test]
    fn voltage_uses_cell_class() {
        let mut s = healthy();
        s.battery = BatteryStatus { voltage: Some(14.2), current: None, remaining: Some(80) };
        // 14.2V reads as 4S, below 14.8
        assert_eq!(gate().check(&s, false, false).unwrap_err(), GateFailure::VoltageLow { voltage: 14.2, min: 14.8 });
        s.battery.voltage = Some(0.0);
        assert!(gate().check(&s, false, false).is_ok());
    }

    #[test]
    fn system_status_policy() {
        let mut s = healthy();
        s.system_status = Some(SystemStatus::Critical);
        assert!(gate().check(&s, true, false).is_err());
        assert!(gate().check(&s, false, false).is_ok());
        s.system_status = Some(SystemStatus::Calibrating);
        assert!(gate().check(&s, false, false).is_err());
        s.system_status = None;
        assert!(gate().check(&s, true, false).is_ok());
    }

    #[test]
    fn every_single_failure_blocks_arming() {
        let breakers: Vec<fn(&mut VehicleSnapshot)> = vec![
            |s| s.connected = false,
            |s| s.heartbeat_age = Some(Duration::from_secs(30)),
            |s| s.heartbeat_age = None,
            |s| s.armable = None,
            |s| s.gps = Some(GpsStatus { fix_type: 1, satellites: Some(10), eph: None }),
            |s| s.battery.remaining = Some(5),
            |s| s.battery.voltage = Some(10.0),
            |s| s.system_status = Some(SystemStatus::Boot),
        ];
        for (i, brk) in breakers.iter().enumerate() {
            let mut s = healthy();
            brk(&mut s);
            assert!(!gate().is_ready(&s, true, false).ready, "breaker {} passed", i);
        }
    }
}
