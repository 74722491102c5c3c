use std::fmt;
use std::time::Duration;

use serde::Serialize;
use skyguard_nav::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    /// Meters above the home/takeoff point.
    pub alt_rel_m: f64,
    pub alt_msl_m: Option<f64>,
}

impl Position {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// Radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatteryStatus {
    pub voltage: Option<f32>,      // Volts
    pub current: Option<f32>,      // Amps
    pub remaining: Option<u8>,     // Percent 0-100
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpsStatus {
    /// 0-1 no fix, 2 = 2D, 3 = 3D, higher = DGPS/RTK.
    pub fix_type: u8,
    pub satellites: Option<u8>,
    /// Horizontal dilution of precision.
    pub eph: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemStatus {
    Uninit,
    Boot,
    Calibrating,
    Standby,
    Active,
    Critical,
    Emergency,
    Poweroff,
    FlightTermination,
}

impl SystemStatus {
    /// Ready to be armed.
    pub fn is_armable_state(self) -> bool {
        matches!(self, SystemStatus::Standby | SystemStatus::Active)
    }

    /// Able to accept any command at all. Critical/Emergency still are,
    /// since that is when RTL and land get sent.
    pub fn accepts_commands(self) -> bool {
        !matches!(
            self,
            SystemStatus::Uninit
                | SystemStatus::Boot
                | SystemStatus::Calibrating
                | SystemStatus::Poweroff
                | SystemStatus::FlightTermination
        )
    }
}

/// ArduCopter flight modes we command or expect to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FlightMode {
    Stabilize,
    AltHold,
    Auto,
    Guided,
    Loiter,
    Rtl,
    Land,
    Brake,
    Other(u32),
}

impl FlightMode {
    pub fn custom_mode(self) -> u32 {
        match self {
            FlightMode::Stabilize => 0,
            FlightMode::AltHold => 2,
            FlightMode::Auto => 3,
            FlightMode::Guided => 4,
            FlightMode::Loiter => 5,
            FlightMode::Rtl => 6,
            FlightMode::Land => 9,
            FlightMode::Brake => 17,
            FlightMode::Other(m) => m,
        }
    }

    pub fn from_custom_mode(mode: u32) -> Self {
        match mode {
            0 => FlightMode::Stabilize,
            2 => FlightMode::AltHold,
            3 => FlightMode::Auto,
            4 => FlightMode::Guided,
            5 => FlightMode::Loiter,
            6 => FlightMode::Rtl,
            9 => FlightMode::Land,
            17 => FlightMode::Brake,
            m => FlightMode::Other(m),
        }
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightMode::Stabilize => f.write_str("STABILIZE"),
            FlightMode::AltHold => f.write_str("ALT_HOLD"),
            FlightMode::Auto => f.write_str("AUTO"),
            FlightMode::Guided => f.write_str("GUIDED"),
            FlightMode::Loiter => f.write_str("LOITER"),
            FlightMode::Rtl => f.write_str("RTL"),
            FlightMode::Land => f.write_str("LAND"),
            FlightMode::Brake => f.write_str("BRAKE"),
            FlightMode::Other(m) => write!(f, "MODE_{}", m),
        }
    }
}

/// Point-in-time view of vehicle telemetry. Anything the link has not
/// reported yet is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VehicleSnapshot {
    pub connected: bool,
    pub position: Option<Position>,
    pub attitude: Option<Attitude>,
    pub battery: BatteryStatus,
    pub gps: Option<GpsStatus>,
    pub groundspeed_mps: Option<f32>,
    pub armed: bool,
    pub armable: Option<bool>,
    pub mode: Option<FlightMode>,
    #[serde(skip)]
    pub heartbeat_age: Option<Duration>,
    pub home: Option<GeoPoint>,
    pub system_status: Option<SystemStatus>,
    /// Raw PWM on the throttle RC channel.
    pub throttle_pwm: Option<u16>,
}

impl VehicleSnapshot {
    pub fn altitude(&self) -> Option<f64> {
        self.position.map(|p| p.alt_rel_m)
    }

    pub fn location(&self) -> Option<GeoPoint> {
        self.position.map(|p| p.point())
    }

    pub fn battery_percent(&self) -> Option<u8> {
        self.battery.remaining
    }

    pub fn gps_fix(&self) -> Option<u8> {
        self.gps.map(|g| g.fix_type)
    }

    pub fn satellites(&self) -> Option<u8> {
        self.gps.and_then(|g| g.satellites)
    }

    pub fn eph(&self) -> Option<f32> {
        self.gps.and_then(|g| g.eph)
    }

    pub fn is_mode(&self, mode: FlightMode) -> bool {
        self.mode == Some(mode)
    }

    /// Home that can actually be flown to: present, in range and not (0,0).
    pub fn valid_home(&self) -> Option<GeoPoint> {
        self.home.filter(|h| h.is_valid() && !h.is_null_island())
    }

    pub fn distance_to_home(&self) -> Option<f64> {
        let here = self.location()?;
        let home = self.valid_home()?;
        Some(here.distance_to(&home))
    }

    pub fn hb_age(&self) -> Option<Duration> {
        self.heartbeat_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_numbers_round_trip_and_print() {
        assert_eq!(FlightMode::from_custom_mode(FlightMode::Guided.custom_mode()), FlightMode::Guided);
        assert_eq!(FlightMode::from_custom_mode(21), FlightMode::Other(21));
        assert_eq!(FlightMode::AltHold.to_string(), "ALT_HOLD");
    }

    #[test]
    fn null_island_home_is_not_valid() {
        let mut s = VehicleSnapshot {
            position: Some(Position { lat: 1.0, lon: 1.0, alt_rel_m: 10.0, alt_msl_m: None }),
            home: Some(GeoPoint::new(0.0, 0.0)),
            ..Default::default()
        };
        assert!(s.valid_home().is_none());
        assert!(s.distance_to_home().is_none());

        s.home = Some(GeoPoint::new(1.0, 1.0));
        assert_eq!(s.distance_to_home(), Some(0.0));
    }

    #[test]
    fn critical_status_still_accepts_commands() {
        assert!(SystemStatus::Critical.accepts_commands());
        assert!(!SystemStatus::Critical.is_armable_state());
        assert!(!SystemStatus::Boot.accepts_commands());
    }
}
