//! Read-only health assessments built from a single snapshot (or two,
//! for anomaly detection). Nothing here commands the vehicle.

use std::time::Duration;

use serde::Serialize;

use crate::gate::ReadinessGate;
use crate::safety::SafetyThresholds;
use crate::state::VehicleSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Health {
    Good,
    Low,
    Poor,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatteryReport {
    pub percent: Option<u8>,
    pub voltage: Option<f32>,
    pub current: Option<f32>,
    pub min_voltage: Option<f32>,
    pub status: Health,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpsReport {
    pub fix_type: Option<u8>,
    pub satellites: Option<u8>,
    pub eph: Option<f32>,
    pub status: Health,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommsReport {
    pub heartbeat_age_s: Option<f64>,
    pub health_score: f64,
    pub status: Health,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyReport {
    pub ready: bool,
    pub readiness_reasons: Vec<String>,
    pub battery: BatteryReport,
    pub gps: GpsReport,
    pub comms: CommsReport,
    pub emergencies: Vec<String>,
    pub return_home: ReturnFeasibility,
    pub overall: Health,
    pub recommendations: Vec<String>,
}

pub fn safety_report(snap: &VehicleSnapshot, t: &SafetyThresholds, gate: &ReadinessGate) -> SafetyReport {
    let readiness = gate.is_ready(snap, false, true);

    let voltage = snap.battery.voltage.filter(|v| *v > 0.0);
    let percent = snap.battery.remaining;
    let battery_status = match (percent, voltage) {
        (None, None) => Health::Unknown,
        (Some(p), _) if p > 50 => Health::Good,
        (Some(p), _) if p > 20 => Health::Low,
        (Some(_), _) => Health::Critical,
        (None, Some(v)) if v < t.min_voltage_for(v) => Health::Critical,
        (None, Some(_)) => Health::Unknown,
    };
    let battery = BatteryReport {
        percent,
        voltage,
        current: snap.battery.current,
        min_voltage: voltage.map(|v| t.min_voltage_for(v)),
        status: battery_status,
    };

    let gps = GpsReport {
        fix_type: snap.gps_fix(),
        satellites: snap.satellites(),
        eph: snap.eph(),
        status: match snap.gps {
            None => Health::Unknown,
            Some(g) if g.fix_type >= 3 && g.satellites.unwrap_or(0) >= 8 => Health::Good,
            Some(_) => Health::Poor,
        },
    };

    let age = snap.heartbeat_age;
    let comms = CommsReport {
        heartbeat_age_s: age.map(|a| a.as_secs_f64()),
        health_score: connection_health(snap.connected, age),
        status: if snap.connected && age.is_some_and(|a| a < Duration::from_secs(2)) { Health::Good } else { Health::Poor },
    };

    let emergencies = check_emergency_conditions(snap, t);
    let return_home = return_feasibility(snap);

    let mut recommendations = Vec::new();
    if battery.status == Health::Unknown {
        recommendations.push("Battery telemetry missing, check the power module and BATT_MONITOR".to_string());
    }
    if percent.is_some_and(|p| p < t.min_battery_percent) {
        recommendations.push("Consider landing soon, battery is low".to_string());
    }
    if snap.satellites().unwrap_or(0) < t.min_satellites {
        recommendations.push("Wait for better GPS before flying".to_string());
    }
    if !emergencies.is_empty() {
        recommendations.push("Address emergency conditions before flight".to_string());
    }
    if snap.armed && !return_home.feasible {
        recommendations.push(format!("Return home may not be possible: {}", return_home.reason));
    }

    let statuses = [battery.status, gps.status, comms.status];
    let overall = if !emergencies.is_empty() || battery.status == Health::Critical {
        Health::Critical
    } else if statuses.iter().all(|s| *s == Health::Good) && readiness.ready {
        Health::Good
    } else if statuses.contains(&Health::Unknown) {
        Health::Unknown
    } else {
        Health::Poor
    };

    SafetyReport {
        ready: readiness.ready,
        readiness_reasons: readiness.reasons,
        battery,
        gps,
        comms,
        emergencies,
        return_home,
        overall,
        recommendations,
    }
}

/// Conditions that call for immediate action, as stable tags.
pub fn check_emergency_conditions(snap: &VehicleSnapshot, t: &SafetyThresholds) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(p) = snap.battery.remaining {
        if p <= 10 {
            out.push(format!("CRITICAL_BATTERY_LEVEL_{}%", p));
        } else if p <= 20 {
            out.push(format!("LOW_BATTERY_LEVEL_{}%", p));
        }
    }
    if let Some(v) = snap.battery.voltage.filter(|v| *v > 0.0) {
        if v < t.min_voltage_for(v) * 0.9 {
            out.push(format!("CRITICAL_BATTERY_VOLTAGE_{:.1}V", v));
        }
    }
    if let Some(g) = snap.gps {
        if g.fix_type < 2 {
            out.push(format!("GPS_FIX_LOST_{}", g.fix_type));
        } else if let Some(sats) = g.satellites.filter(|s| *s < t.min_satellites) {
            out.push(format!("GPS_SATELLITES_LOW_{}", sats));
        }
    }
    if let Some(age) = snap.heartbeat_age.filter(|a| *a > Duration::from_secs(10)) {
        out.push(format!("COMMUNICATION_LOST_{:.1}s", age.as_secs_f64()));
    }
    out
}

/// 0.0 to 1.0 from heartbeat age.
pub fn connection_health(connected: bool, heartbeat_age: Option<Duration>) -> f64 {
    if !connected {
        return 0.0;
    }
    match heartbeat_age.map(|a| a.as_secs_f64()) {
        None => 0.1,
        Some(a) if a < 2.0 => 1.0,
        Some(a) if a < 5.0 => 0.8,
        Some(a) if a < 10.0 => 0.5,
        Some(_) => 0.1,
    }
}

const RETURN_SPEED_MPS: f64 = 10.0;
const BATTERY_PER_MINUTE: f64 = 2.0;
const BATTERY_MARGIN: f64 = 10.0;

#[derive(Debug, Clone, Serialize)]
pub struct ReturnFeasibility {
    pub feasible: bool,
    pub reason: String,
    pub distance_m: Option<f64>,
    pub flight_time_s: Option<f64>,
    pub battery_required_percent: Option<f64>,
}

pub fn return_feasibility(snap: &VehicleSnapshot) -> ReturnFeasibility {
    let infeasible = |reason: &str| ReturnFeasibility {
        feasible: false,
        reason: reason.to_string(),
        distance_m: None,
        flight_time_s: None,
        battery_required_percent: None,
    };
    let Some(home) = snap.valid_home() else {
        return infeasible("no valid home location");
    };
    let Some(here) = snap.location() else {
        return infeasible("no current position");
    };
    let distance = here.distance_to(&home);
    let time_s = distance / RETURN_SPEED_MPS;
    let required = time_s / 60.0 * BATTERY_PER_MINUTE;
    let available = snap.battery.remaining.map(f64::from).unwrap_or(0.0);
    let feasible = available >= required + BATTERY_MARGIN;
    let reason = if feasible {
        format!("{:.0}m home, needs {:.1}% of {:.0}%", distance, required, available)
    } else {
        format!("insufficient battery: need {:.1}% plus margin, have {:.0}%", required, available)
    };
    ReturnFeasibility {
        feasible,
        reason,
        distance_m: Some(distance),
        flight_time_s: Some(time_s),
        battery_required_percent: Some(required),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    AltitudeJump { change_m: f64 },
    PositionJump { distance_m: f64 },
    VoltageDrop { drop_v: f32 },
}

/// Compare two consecutive snapshots for implausible jumps.
pub fn detect_anomalies(prev: &VehicleSnapshot, cur: &VehicleSnapshot) -> Vec<Anomaly> {
    let mut out = Vec::new();
    if let (Some(a), Some(b)) = (prev.altitude(), cur.altitude()) {
        let change_m = (b - a).abs();
        if change_m > 10.0 {
            out.push(Anomaly::AltitudeJump { change_m });
        }
    }
    if let (Some(a), Some(b)) = (prev.location(), cur.location()) {
        let distance_m = a.distance_to(&b);
        if distance_m > 100.0 {
            out.push(Anomaly::PositionJump { distance_m });
        }
    }
    let volts = |s: &VehicleSnapshot| s.battery.voltage.filter(|v| *v > 0.0);
    if let (Some(a), Some(b)) = (volts(prev), volts(cur)) {
        let drop_v = a - b;
        if drop_v > 2.0 {
            out.push(Anomaly::VoltageDrop { drop_v });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use skyguard_nav::GeoPoint;

    use super::*;
    use crate::state::{BatteryStatus, GpsStatus, Position};

    fn snap() -> VehicleSnapshot {
        VehicleSnapshot {
            connected: true,
            position: Some(Position { lat: 47.3977, lon: 8.5456, alt_rel_m: 10.0, alt_msl_m: None }),
            battery: BatteryStatus { voltage: Some(12.4), current: Some(8.0), remaining: Some(80) },
            gps: Some(GpsStatus { fix_type: 3, satellites: Some(11), eph: Some(0.8) }),
            armable: Some(true),
            heartbeat_age: Some(Duration::from_millis(400)),
            home: Some(GeoPoint::new(47.3977, 8.5456)),
            ..Default::default()
        }
    }

    #[test]
    fn healthy_report_is_good() {
        let t = SafetyThresholds::default();
        let gate = ReadinessGate::new(Arc::new(t.clone()));
        let r = safety_report(&snap(), &t, &gate);
        assert_eq!(r.overall, Health::Good);
        assert!(r.emergencies.is_empty());
        assert!(r.recommendations.is_empty(), "{:?}", r.recommendations);
    }

    #[test]
    fn battery_classes() {
        let t = SafetyThresholds::default();
        let gate = ReadinessGate::new(Arc::new(t.clone()));
        let mut s = snap();
        s.battery.remaining = Some(35);
        assert_eq!(safety_report(&s, &t, &gate).battery.status, Health::Low);
        s.battery.remaining = Some(15);
        let r = safety_report(&s, &t, &gate);
        assert_eq!(r.battery.status, Health::Critical);
        assert_eq!(r.overall, Health::Critical);
        s.battery = BatteryStatus::default();
        assert_eq!(safety_report(&s, &t, &gate).battery.status, Health::Unknown);
    }

    #[test]
    fn emergency_tags() {
        let t = SafetyThresholds::default();
        let mut s = snap();
        s.battery.remaining = Some(9);
        s.battery.voltage = Some(9.5);
        s.gps = Some(GpsStatus { fix_type: 1, satellites: Some(3), eph: None });
        s.heartbeat_age = Some(Duration::from_secs(12));
        let e = check_emergency_conditions(&s, &t);
        assert_eq!(
            e,
            vec!["CRITICAL_BATTERY_LEVEL_9%", "CRITICAL_BATTERY_VOLTAGE_9.5V", "GPS_FIX_LOST_1", "COMMUNICATION_LOST_12.0s"]
        );
    }

    #[test]
    fn health_score_bands() {
        assert_eq!(connection_health(true, Some(Duration::from_millis(500))), 1.0);
        assert_eq!(connection_health(true, Some(Duration::from_secs(3))), 0.8);
        assert_eq!(connection_health(true, Some(Duration::from_secs(7))), 0.5);
        assert_eq!(connection_health(true, Some(Duration::from_secs(30))), 0.1);
        assert_eq!(connection_health(false, Some(Duration::from_millis(500))), 0.0);
    }

    #[test]
    fn return_needs_margin() {
        let mut s = snap();
        // ~1.1 km from home: 111 s at 10 m/s, 3.7 % needed
        s.position = Some(Position { lat: 47.4077, lon: 8.5456, alt_rel_m: 20.0, alt_msl_m: None });
        s.battery.remaining = Some(15);
        let f = return_feasibility(&s);
        assert!(f.feasible);
        s.battery.remaining = Some(12);
        assert!(!return_feasibility(&s).feasible);

        s.home = Some(GeoPoint::new(0.0, 0.0));
        assert!(!return_feasibility(&s).feasible);
    }

    #[test]
    fn anomalies_between_snapshots() {
        let a = snap();
        let mut b = snap();
        assert!(detect_anomalies(&a, &b).is_empty());
        b.position = Some(Position { lat: 47.4, lon: 8.5456, alt_rel_m: 25.0, alt_msl_m: None });
        b.battery.voltage = Some(10.0);
        let found = detect_anomalies(&a, &b);
        assert_eq!(found.len(), 3);
        assert!(matches!(found[0], Anomaly::AltitudeJump { .. }));
    }
}
