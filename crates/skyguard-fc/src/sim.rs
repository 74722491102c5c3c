//! Kinematic multicopter stand-in for a real flight controller.
//!
//! Point-mass motion at fixed climb, descent and cruise rates, advanced
//! lazily on every call from the elapsed tokio time. Good enough to drive
//! the controller through takeoff, waypoints, RTL and landing in tests and
//! dry runs; it does not model attitude, wind or sensor noise.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use skyguard_nav::geo::EARTH_RADIUS_M;
use skyguard_nav::GeoPoint;
use tokio::time::Instant;
use tracing::debug;

use crate::link::VehicleLink;
use crate::lock;
use crate::state::{BatteryStatus, FlightMode, GpsStatus, Position, SystemStatus, VehicleSnapshot};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub start: GeoPoint,
    /// Reported home; defaults to the start point.
    pub home: Option<GeoPoint>,
    pub climb_rate_mps: f64,
    pub descent_rate_mps: f64,
    pub cruise_speed_mps: f64,
    pub rtl_altitude_m: f64,
    pub battery_percent: f64,
    /// Percent of capacity per meter flown horizontally.
    pub drain_per_meter: f64,
    /// Percent per second while armed.
    pub drain_per_second: f64,
    pub full_voltage: f32,
    pub empty_voltage: f32,
    pub satellites: u8,
    pub eph: f32,
    pub heartbeat_age: Duration,
    /// Integration step.
    pub step: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        let start = GeoPoint::new(47.397742, 8.545594);
        Self {
            start,
            home: Some(start),
            climb_rate_mps: 2.5,
            descent_rate_mps: 1.5,
            cruise_speed_mps: 5.0,
            rtl_altitude_m: 15.0,
            battery_percent: 100.0,
            drain_per_meter: 0.0,
            drain_per_second: 0.0,
            full_voltage: 12.6,
            empty_voltage: 10.5,
            satellites: 12,
            eph: 0.9,
            heartbeat_age: Duration::from_millis(200),
            step: Duration::from_millis(100),
        }
    }
}

/// What the controller asked the simulated vehicle to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCommand {
    SetMode(FlightMode),
    Arm(bool),
    Takeoff(f64),
    Goto { lat: f64, lon: f64, alt: f64 },
    Throttle(Option<u16>),
}

const RC_LOW: u16 = 1000;
const THROTTLE_CUT_FALL_MPS: f64 = 3.0;
const ARRIVAL_M: f64 = 0.5;

#[derive(Debug)]
struct Sim {
    cfg: SimConfig,
    pos: GeoPoint,
    alt: f64,
    armed: bool,
    armable: bool,
    mode: FlightMode,
    climb_target: Option<f64>,
    goto: Option<(GeoPoint, f64)>,
    battery: f64,
    groundspeed: f64,
    throttle_override: Option<u16>,
    rc_throttle: u16,
    gps: Option<GpsStatus>,
    connected: bool,
    heartbeat_age: Duration,
    home: Option<GeoPoint>,
    refused_modes: Vec<FlightMode>,
    last: Instant,
    log: Vec<SimCommand>,
}

fn move_toward(from: GeoPoint, to: GeoPoint, max_m: f64) -> (GeoPoint, f64) {
    let d = from.distance_to(&to);
    if d <= max_m {
        return (to, d);
    }
    let brg = from.bearing_to(&to).to_radians();
    let dlat = (max_m * brg.cos() / EARTH_RADIUS_M).to_degrees();
    let dlon = (max_m * brg.sin() / (EARTH_RADIUS_M * from.lat.to_radians().cos())).to_degrees();
    (GeoPoint::new(from.lat + dlat, from.lon + dlon), max_m)
}

fn approach(cur: f64, target: f64, max_step: f64) -> f64 {
    if (target - cur).abs() <= max_step {
        target
    } else {
        cur + max_step.copysign(target - cur)
    }
}

impl Sim {
    fn advance(&mut self, now: Instant) {
        let mut remaining = now.saturating_duration_since(self.last);
        self.last = now;
        while !remaining.is_zero() {
            let dt = remaining.min(self.cfg.step);
            remaining -= dt;
            self.integrate(dt.as_secs_f64());
        }
    }

    fn integrate(&mut self, dt: f64) {
        if !self.armed {
            self.groundspeed = 0.0;
            return;
        }
        self.battery = (self.battery - self.cfg.drain_per_second * dt).max(0.0);
        let mut moved = 0.0;

        if self.throttle_override.is_some_and(|p| p <= RC_LOW + 50) && self.alt > 0.0 {
            self.alt = (self.alt - THROTTLE_CUT_FALL_MPS * dt).max(0.0);
            if self.alt == 0.0 {
                self.touchdown();
            }
            return;
        }

        match self.mode {
            FlightMode::Guided => {
                if let Some(target) = self.climb_target {
                    self.alt = approach(self.alt, target, self.cfg.climb_rate_mps * dt);
                    if self.alt == target {
                        self.climb_target = None;
                    }
                } else if let Some((to, alt)) = self.goto.filter(|_| self.alt > ARRIVAL_M) {
                    let (p, m) = move_toward(self.pos, to, self.cfg.cruise_speed_mps * dt);
                    self.pos = p;
                    moved = m;
                    self.alt = approach(self.alt, alt, self.cfg.climb_rate_mps * dt);
                }
            }
            FlightMode::Land => self.descend(dt),
            FlightMode::Rtl => match self.home.filter(|h| h.is_valid() && !h.is_null_island()) {
                Some(home) if self.pos.distance_to(&home) > ARRIVAL_M => {
                    if self.alt < self.cfg.rtl_altitude_m {
                        self.alt = approach(self.alt, self.cfg.rtl_altitude_m, self.cfg.climb_rate_mps * dt);
                    } else {
                        let (p, m) = move_toward(self.pos, home, self.cfg.cruise_speed_mps * dt);
                        self.pos = p;
                        moved = m;
                    }
                }
                _ => self.descend(dt),
            },
            _ => {}
        }

        self.groundspeed = moved / dt;
        self.battery = (self.battery - self.cfg.drain_per_meter * moved).max(0.0);
    }

    fn descend(&mut self, dt: f64) {
        self.alt = (self.alt - self.cfg.descent_rate_mps * dt).max(0.0);
        if self.alt == 0.0 {
            self.touchdown();
        }
    }

    fn touchdown(&mut self) {
        debug!(event = "sim_touchdown", lat = self.pos.lat, lon = self.pos.lon);
        self.armed = false;
        self.climb_target = None;
        self.goto = None;
        self.groundspeed = 0.0;
    }

    fn voltage(&self) -> f32 {
        let span = self.cfg.full_voltage - self.cfg.empty_voltage;
        self.cfg.empty_voltage + span * (self.battery / 100.0) as f32
    }

    fn snapshot(&self) -> VehicleSnapshot {
        VehicleSnapshot {
            connected: self.connected,
            position: Some(Position { lat: self.pos.lat, lon: self.pos.lon, alt_rel_m: self.alt, alt_msl_m: Some(self.alt + 408.0) }),
            attitude: None,
            battery: BatteryStatus {
                voltage: Some(self.voltage()),
                current: Some(if self.armed { 12.0 } else { 0.4 }),
                remaining: Some(self.battery.round().clamp(0.0, 100.0) as u8),
            },
            gps: self.gps,
            groundspeed_mps: Some(self.groundspeed as f32),
            armed: self.armed,
            armable: Some(self.armable),
            mode: Some(self.mode),
            heartbeat_age: Some(self.heartbeat_age),
            home: self.home,
            system_status: Some(if self.armed { SystemStatus::Active } else { SystemStatus::Standby }),
            throttle_pwm: Some(self.throttle_override.unwrap_or(self.rc_throttle)),
        }
    }
}

/// In-process vehicle implementing [`VehicleLink`].
#[derive(Debug)]
pub struct SimVehicle {
    inner: Mutex<Sim>,
}

impl SimVehicle {
    pub fn new(cfg: SimConfig) -> Self {
        let gps = Some(GpsStatus { fix_type: 3, satellites: Some(cfg.satellites), eph: Some(cfg.eph) });
        let sim = Sim {
            pos: cfg.start,
            alt: 0.0,
            armed: false,
            armable: true,
            mode: FlightMode::Stabilize,
            climb_target: None,
            goto: None,
            battery: cfg.battery_percent,
            groundspeed: 0.0,
            throttle_override: None,
            rc_throttle: RC_LOW,
            gps,
            connected: true,
            heartbeat_age: cfg.heartbeat_age,
            home: cfg.home,
            refused_modes: Vec::new(),
            last: Instant::now(),
            log: Vec::new(),
            cfg,
        };
        Self { inner: Mutex::new(sim) }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Sim) -> R) -> R {
        let mut sim = lock(&self.inner);
        sim.advance(Instant::now());
        f(&mut sim)
    }

    pub fn set_battery(&self, percent: f64) {
        self.with(|s| s.battery = percent);
    }

    pub fn set_drain_per_meter(&self, percent: f64) {
        self.with(|s| s.cfg.drain_per_meter = percent);
    }

    pub fn set_gps(&self, gps: Option<GpsStatus>) {
        self.with(|s| s.gps = gps);
    }

    pub fn set_heartbeat_age(&self, age: Duration) {
        self.with(|s| s.heartbeat_age = age);
    }

    pub fn set_connected(&self, connected: bool) {
        self.with(|s| s.connected = connected);
    }

    pub fn set_home(&self, home: Option<GeoPoint>) {
        self.with(|s| s.home = home);
    }

    pub fn set_armable(&self, armable: bool) {
        self.with(|s| s.armable = armable);
    }

    pub fn set_rc_throttle(&self, pwm: u16) {
        self.with(|s| s.rc_throttle = pwm);
    }

    /// The vehicle will silently ignore requests for `mode`.
    pub fn refuse_mode(&self, mode: FlightMode) {
        self.with(|s| s.refused_modes.push(mode));
    }

    /// Teleport to an armed hover, for scenarios that start mid-flight.
    pub fn place_airborne(&self, at: GeoPoint, alt_m: f64, mode: FlightMode) {
        self.with(|s| {
            s.pos = at;
            s.alt = alt_m;
            s.armed = true;
            s.mode = mode;
        });
    }

    pub fn commands(&self) -> Vec<SimCommand> {
        lock(&self.inner).log.clone()
    }

    pub fn mode(&self) -> FlightMode {
        self.with(|s| s.mode)
    }

    pub fn is_armed(&self) -> bool {
        self.with(|s| s.armed)
    }

    pub fn position(&self) -> (GeoPoint, f64) {
        self.with(|s| (s.pos, s.alt))
    }
}

impl VehicleLink for SimVehicle {
    fn snapshot(&self) -> VehicleSnapshot {
        self.with(|s| s.snapshot())
    }

    fn set_mode(&self, mode: FlightMode) -> Result<()> {
        self.with(|s| {
            if !s.connected {
                bail!("simulated link down");
            }
            s.log.push(SimCommand::SetMode(mode));
            if s.refused_modes.contains(&mode) {
                return Ok(());
            }
            if mode != FlightMode::Guided {
                s.climb_target = None;
                s.goto = None;
            }
            s.mode = mode;
            Ok(())
        })
    }

    fn set_armed(&self, armed: bool) -> Result<()> {
        self.with(|s| {
            if !s.connected {
                bail!("simulated link down");
            }
            s.log.push(SimCommand::Arm(armed));
            if armed {
                let throttle = s.throttle_override.unwrap_or(s.rc_throttle);
                let gps_ok = s.gps.is_some_and(|g| g.fix_type >= 3);
                let mode_ok = matches!(s.mode, FlightMode::Guided | FlightMode::Stabilize | FlightMode::AltHold | FlightMode::Loiter);
                if s.armable && gps_ok && mode_ok && throttle <= 1100 {
                    s.armed = true;
                }
            } else {
                if s.alt > 0.0 {
                    debug!(event = "sim_disarm_in_air", alt_m = s.alt);
                    s.alt = 0.0;
                }
                s.touchdown();
            }
            Ok(())
        })
    }

    fn command_takeoff(&self, altitude_m: f64) -> Result<()> {
        self.with(|s| {
            if !s.connected {
                bail!("simulated link down");
            }
            s.log.push(SimCommand::Takeoff(altitude_m));
            if s.armed && s.mode == FlightMode::Guided && altitude_m > s.alt {
                s.climb_target = Some(altitude_m);
            }
            Ok(())
        })
    }

    fn command_goto(&self, lat: f64, lon: f64, alt_m: f64) -> Result<()> {
        self.with(|s| {
            if !s.connected {
                bail!("simulated link down");
            }
            s.log.push(SimCommand::Goto { lat, lon, alt: alt_m });
            if s.mode == FlightMode::Guided {
                s.climb_target = None;
                s.goto = Some((GeoPoint::new(lat, lon), alt_m));
            }
            Ok(())
        })
    }

    fn override_throttle(&self, pwm: Option<u16>) -> Result<()> {
        self.with(|s| {
            if !s.connected {
                bail!("simulated link down");
            }
            s.log.push(SimCommand::Throttle(pwm));
            s.throttle_override = pwm;
            Ok(())
        })
    }

    fn describe(&self) -> String {
        "sim".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn climbs_and_cruises() {
        let v = SimVehicle::new(SimConfig::default());
        v.set_mode(FlightMode::Guided).unwrap();
        v.set_armed(true).unwrap();
        v.command_takeoff(10.0).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((v.position().1 - 5.0).abs() < 0.01);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(v.position().1, 10.0);

        let start = v.position().0;
        let target = GeoPoint::new(start.lat + 0.0009, start.lon);
        v.command_goto(target.lat, target.lon, 10.0).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let moved = start.distance_to(&v.position().0);
        assert!((moved - 50.0).abs() < 0.5, "moved {}", moved);
    }

    #[tokio::test(start_paused = true)]
    async fn land_disarms_on_touchdown() {
        let v = SimVehicle::new(SimConfig::default());
        v.place_airborne(SimConfig::default().start, 3.0, FlightMode::Guided);
        v.set_mode(FlightMode::Land).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!v.is_armed());
        assert_eq!(v.position().1, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_to_arm_with_throttle_up() {
        let v = SimVehicle::new(SimConfig::default());
        v.set_rc_throttle(1500);
        v.set_mode(FlightMode::Guided).unwrap();
        v.set_armed(true).unwrap();
        assert!(!v.is_armed());
        assert_eq!(v.commands(), vec![SimCommand::SetMode(FlightMode::Guided), SimCommand::Arm(true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn battery_drains_with_distance() {
        let cfg = SimConfig { battery_percent: 80.0, drain_per_meter: 0.4, ..Default::default() };
        let start = cfg.start;
        let v = SimVehicle::new(cfg);
        v.place_airborne(start, 10.0, FlightMode::Guided);
        v.command_goto(start.lat + 0.001, start.lon, 10.0).unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        // 25 m flown
        assert_eq!(v.snapshot().battery_percent(), Some(70));
    }
}
