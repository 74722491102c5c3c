use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

/// Every flight-safety limit in one place. Built once from config at
/// startup and shared read-only for the rest of the session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyThresholds {
    pub version: u32,

    pub min_altitude_m: f64,
    pub max_altitude_m: f64,
    pub max_flight_time_s: f64,
    pub max_distance_from_home_m: f64,

    /// Readiness floor for arming and normal commands.
    pub min_battery_percent: u8,
    /// Below this a running mission or hold opens an emergency prompt.
    pub critical_battery_percent: u8,
    /// Below this the failsafe watchdog returns home on its own.
    pub failsafe_battery_percent: u8,
    /// Required to start a waypoint mission.
    pub mission_min_battery_percent: u8,

    pub min_voltage_3s: f32,
    pub min_voltage_4s: f32,
    pub min_voltage_6s: f32,
    /// Extra headroom over the cell minimum required at takeoff.
    pub takeoff_voltage_margin: f32,

    pub min_gps_fix: u8,
    pub command_gps_fix: u8,
    pub min_satellites: u8,
    pub max_eph: f32,
    pub max_eph_simulated: f32,
    pub max_groundspeed_mps: f32,
    pub max_groundspeed_simulated_mps: f32,
    /// Home recorded with worse precision than this is not trusted.
    pub home_max_eph: f32,

    pub max_heartbeat_age_s: f64,
    pub command_timeout_s: f64,

    pub safe_throttle_pwm: u16,
    /// Emergency disarm above this altitude turns into an emergency land.
    pub airborne_altitude_m: f64,
    pub touchdown_altitude_m: f64,
    /// Land requests below this altitude are already done.
    pub on_ground_altitude_m: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            version: 1,
            min_altitude_m: 0.5,
            max_altitude_m: 30.0,
            max_flight_time_s: 300.0,
            max_distance_from_home_m: 100.0,
            min_battery_percent: 30,
            critical_battery_percent: 25,
            failsafe_battery_percent: 20,
            mission_min_battery_percent: 25,
            min_voltage_3s: 11.1,
            min_voltage_4s: 14.8,
            min_voltage_6s: 22.2,
            takeoff_voltage_margin: 0.3,
            min_gps_fix: 3,
            command_gps_fix: 2,
            min_satellites: 6,
            max_eph: 2.0,
            max_eph_simulated: 200.0,
            max_groundspeed_mps: 50.0,
            max_groundspeed_simulated_mps: 150.0,
            home_max_eph: 5.0,
            max_heartbeat_age_s: 5.0,
            command_timeout_s: 30.0,
            safe_throttle_pwm: 1100,
            airborne_altitude_m: 2.0,
            touchdown_altitude_m: 0.5,
            on_ground_altitude_m: 1.0,
        }
    }
}

impl SafetyThresholds {
    /// Minimum pack voltage for the lowest cell count the reading fits.
    pub fn min_voltage_for(&self, voltage: f32) -> f32 {
        if voltage > 20.0 {
            self.min_voltage_6s
        } else if voltage > 13.0 {
            self.min_voltage_4s
        } else {
            self.min_voltage_3s
        }
    }

    pub fn max_eph_for(&self, profile: VehicleProfile) -> f32 {
        match profile {
            VehicleProfile::Physical => self.max_eph,
            VehicleProfile::Simulated => self.max_eph_simulated,
        }
    }

    pub fn max_groundspeed_for(&self, profile: VehicleProfile) -> f32 {
        match profile {
            VehicleProfile::Physical => self.max_groundspeed_mps,
            VehicleProfile::Simulated => self.max_groundspeed_simulated_mps,
        }
    }

    pub fn max_heartbeat_age(&self) -> Duration {
        Duration::from_secs_f64(self.max_heartbeat_age_s)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout_s)
    }

    pub fn check_altitude(&self, alt_m: f64) -> Result<(), String> {
        if !alt_m.is_finite() || alt_m < self.min_altitude_m || alt_m > self.max_altitude_m {
            return Err(format!(
                "altitude {}m outside {}..{}m",
                alt_m, self.min_altitude_m, self.max_altitude_m
            ));
        }
        Ok(())
    }

    pub fn check_flight_time(&self, secs: f64) -> Result<(), String> {
        if !secs.is_finite() || secs <= 0.0 || secs > self.max_flight_time_s {
            return Err(format!("flight time {}s outside 0..{}s", secs, self.max_flight_time_s));
        }
        Ok(())
    }

    /// Sanity of the loaded values, run by `doctor` and at session start.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.min_altitude_m > 0.0, "safety.min_altitude_m must be > 0");
        anyhow::ensure!(self.min_altitude_m < self.max_altitude_m, "safety.min_altitude_m must be < max_altitude_m");
        anyhow::ensure!(self.max_altitude_m <= 120.0, "safety.max_altitude_m above 120m");
        anyhow::ensure!(self.max_flight_time_s > 0.0, "safety.max_flight_time_s must be > 0");
        anyhow::ensure!(self.max_distance_from_home_m > 0.0, "safety.max_distance_from_home_m must be > 0");
        for (name, v) in [
            ("min_battery_percent", self.min_battery_percent),
            ("critical_battery_percent", self.critical_battery_percent),
            ("failsafe_battery_percent", self.failsafe_battery_percent),
            ("mission_min_battery_percent", self.mission_min_battery_percent),
        ] {
            anyhow::ensure!(v <= 100, "safety.{} must be 0..100", name);
        }
        anyhow::ensure!(
            self.failsafe_battery_percent <= self.critical_battery_percent,
            "safety.failsafe_battery_percent should not exceed critical_battery_percent"
        );
        anyhow::ensure!(
            self.min_voltage_3s < self.min_voltage_4s && self.min_voltage_4s < self.min_voltage_6s,
            "per-cell voltage minimums must increase with cell count"
        );
        anyhow::ensure!(self.min_gps_fix >= self.command_gps_fix, "safety.min_gps_fix below command_gps_fix");
        anyhow::ensure!(self.min_satellites >= 4, "safety.min_satellites too low");
        anyhow::ensure!(self.max_eph > 0.0 && self.max_eph <= self.max_eph_simulated, "safety.max_eph out of range");
        anyhow::ensure!(
            self.max_heartbeat_age_s >= 1.0 && self.max_heartbeat_age_s <= 30.0,
            "safety.max_heartbeat_age_s should be 1..30"
        );
        anyhow::ensure!(self.command_timeout_s > 0.0, "safety.command_timeout_s must be > 0");
        anyhow::ensure!(
            (1000..=1300).contains(&self.safe_throttle_pwm),
            "safety.safe_throttle_pwm should be 1000..1300"
        );
        anyhow::ensure!(self.touchdown_altitude_m < self.on_ground_altitude_m, "touchdown must be below on-ground altitude");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleProfile {
    Physical,
    Simulated,
}

const SIM_HOSTS: &[&str] = &["127.0.0.1", "localhost"];
const HARDWARE_MARKERS: &[&str] = &["/dev/tty", "/dev/serial", "ttyusb", "ttyacm", "serial:", ".serial", "hardware"];

/// Decide whether limits may be relaxed for a simulator. A declared
/// simulator is refused when the connection string looks like hardware.
pub fn resolve_profile(connection: &str, declared_simulated: Option<bool>) -> VehicleProfile {
    let hardware = looks_like_hardware(connection);
    let private_lan = points_at_private_lan(connection);

    match declared_simulated {
        Some(false) => VehicleProfile::Physical,
        Some(true) if hardware || private_lan => {
            warn!(
                event = "profile_refused",
                connection,
                hardware,
                private_lan,
                "link declared simulated but looks like a real vehicle; keeping physical limits"
            );
            VehicleProfile::Physical
        }
        Some(true) => VehicleProfile::Simulated,
        None => {
            if !hardware && !private_lan && looks_simulated(connection) {
                info!(event = "profile_detected", connection, profile = "simulated");
                VehicleProfile::Simulated
            } else {
                VehicleProfile::Physical
            }
        }
    }
}

fn looks_like_hardware(connection: &str) -> bool {
    let lower = connection.to_ascii_lowercase();
    if HARDWARE_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    // Windows serial port: COM3, serial:COM7:57600
    lower
        .split(':')
        .any(|part| part.strip_prefix("com").is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())))
}

fn looks_simulated(connection: &str) -> bool {
    let lower = connection.to_ascii_lowercase();
    let mut parts = lower.split(':');
    let scheme = parts.next().unwrap_or_default();
    if !matches!(scheme, "tcp" | "tcpout" | "udp" | "udpin" | "udpout") {
        return false;
    }
    let host = parts.next().unwrap_or_default();
    SIM_HOSTS.contains(&host)
}

fn points_at_private_lan(connection: &str) -> bool {
    connection
        .split(':')
        .any(|part| part.starts_with("192.168.") || part.starts_with("10."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SafetyThresholds::default().validate().unwrap();
    }

    #[test]
    fn inverted_altitudes_fail_validation() {
        let t = SafetyThresholds { min_altitude_m: 40.0, ..Default::default() };
        assert!(t.validate().is_err());
    }

    #[test]
    fn cell_count_from_voltage() {
        let t = SafetyThresholds::default();
        assert_eq!(t.min_voltage_for(12.4), 11.1);
        assert_eq!(t.min_voltage_for(16.2), 14.8);
        assert_eq!(t.min_voltage_for(24.9), 22.2);
    }

    #[test]
    fn altitude_and_time_bounds() {
        let t = SafetyThresholds::default();
        assert!(t.check_altitude(0.5).is_ok());
        assert!(t.check_altitude(30.0).is_ok());
        assert!(t.check_altitude(0.4).is_err());
        assert!(t.check_altitude(30.1).is_err());
        assert!(t.check_flight_time(300.0).is_ok());
        assert!(t.check_flight_time(0.0).is_err());
    }

    #[test]
    fn simulator_detection() {
        assert_eq!(resolve_profile("tcpout:127.0.0.1:5760", None), VehicleProfile::Simulated);
        assert_eq!(resolve_profile("udpin:localhost:14550", None), VehicleProfile::Simulated);
        assert_eq!(resolve_profile("udpin:0.0.0.0:14550", None), VehicleProfile::Physical);
        assert_eq!(resolve_profile("serial:/dev/ttyACM0:115200", None), VehicleProfile::Physical);
        assert_eq!(resolve_profile("tcpout:127.0.0.1:5760", Some(false)), VehicleProfile::Physical);
    }

    #[test]
    fn declared_simulator_refused_for_hardware() {
        assert_eq!(resolve_profile("serial:/dev/ttyUSB0:57600", Some(true)), VehicleProfile::Physical);
        assert_eq!(resolve_profile("serial:COM4:57600", Some(true)), VehicleProfile::Physical);
        assert_eq!(resolve_profile("udpout:192.168.4.1:14550", Some(true)), VehicleProfile::Physical);
        assert_eq!(resolve_profile("tcpout:10.0.0.7:5760", Some(true)), VehicleProfile::Physical);
        assert_eq!(resolve_profile("sim", Some(true)), VehicleProfile::Simulated);
    }

    #[test]
    fn limits_follow_profile() {
        let t = SafetyThresholds::default();
        assert_eq!(t.max_eph_for(VehicleProfile::Physical), 2.0);
        assert_eq!(t.max_eph_for(VehicleProfile::Simulated), 200.0);
        assert_eq!(t.max_groundspeed_for(VehicleProfile::Simulated), 150.0);
    }
}
