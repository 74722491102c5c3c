pub mod autodetect;
pub mod controller;
pub mod emergency;
pub mod events;
pub mod gate;
pub mod ledger;
pub mod link;
pub mod mav;
pub mod mission;
pub mod report;
pub mod safety;
pub mod session;
pub mod signals;
pub mod sim;
pub mod state;
pub mod wait;
pub mod watchdog;

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Deserialize;

pub use controller::{Controller, ManeuverError, ManeuverState, ManeuverTimeouts};
pub use emergency::NegotiationPolicy;
pub use events::EventSink;
pub use link::VehicleLink;
pub use mission::MissionConfig;
pub use safety::{resolve_profile, SafetyThresholds, VehicleProfile};
pub use session::{FlightSession, SessionConfig};
pub use state::{FlightMode, VehicleSnapshot};
pub use watchdog::WatchdogConfig;

/// A poisoned lock only means another task panicked mid-update; the
/// telemetry and bookkeeping behind these locks stay usable.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FcConfig {
    /// Full mavlink connection string, e.g. `udpin:0.0.0.0:14550` or
    /// `serial:/dev/ttyACM0:115200`. Takes precedence over serial_dev/baud.
    pub connection: Option<String>,

    /// If true and no connection is given, probe candidate serial
    /// ports/bauds and use the first that yields a HEARTBEAT.
    pub autodetect: bool,

    pub serial_dev: Option<String>,
    pub baud: Option<u32>,

    /// Example: ["/dev/serial0","/dev/ttyAMA0","/dev/ttyUSB0","/dev/ttyACM0"]
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,

    /// Heartbeat wait per probe, and at startup.
    pub heartbeat_timeout_ms: u64,

    /// Our MAVLink ids (companion side).
    pub sys_id: u8,
    pub comp_id: u8,

    /// Autopilot ids. 1/1 is common for ArduPilot.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Companion heartbeat rate; 0 disables it.
    pub send_heartbeat_hz: f32,

    /// Declares the far end a simulator. Unset means detect from the
    /// connection string.
    pub simulated: Option<bool>,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            connection: None,
            autodetect: false,
            serial_dev: None,
            baud: None,
            candidate_devs: None,
            candidate_bauds: None,
            heartbeat_timeout_ms: 3000,
            sys_id: 255,
            comp_id: 190,
            target_sys: 1,
            target_comp: 1,
            send_heartbeat_hz: 1.0,
            simulated: None,
        }
    }
}

impl FcConfig {
    pub fn connection_string(&self) -> anyhow::Result<String> {
        if let Some(c) = &self.connection {
            return Ok(c.clone());
        }
        match (&self.serial_dev, self.baud) {
            (Some(dev), Some(baud)) => Ok(format!("serial:{}:{}", dev, baud)),
            (Some(dev), None) => Ok(format!("serial:{}:57600", dev)),
            _ => anyhow::bail!("link: set connection, or serial_dev/baud, or autodetect"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.autodetect || self.connection.is_some() || self.serial_dev.is_some(),
            "link: one of connection, serial_dev or autodetect=true is required"
        );
        anyhow::ensure!(self.heartbeat_timeout_ms > 0, "link.heartbeat_timeout_ms must be positive");
        anyhow::ensure!(self.send_heartbeat_hz >= 0.0, "link.send_heartbeat_hz must not be negative");
        anyhow::ensure!(self.sys_id != self.target_sys, "link.sys_id must differ from target_sys");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_precedence() {
        let mut c = FcConfig { serial_dev: Some("/dev/ttyUSB0".into()), baud: Some(115200), ..Default::default() };
        assert_eq!(c.connection_string().unwrap(), "serial:/dev/ttyUSB0:115200");
        c.connection = Some("tcp:127.0.0.1:5760".into());
        assert_eq!(c.connection_string().unwrap(), "tcp:127.0.0.1:5760");
        assert!(FcConfig::default().connection_string().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let c: FcConfig = toml::from_str("connection = \"udpin:0.0.0.0:14550\"").unwrap();
        assert_eq!(c.target_sys, 1);
        assert_eq!(c.sys_id, 255);
        assert!(c.validate().is_ok());
        assert!(FcConfig::default().validate().is_err());
    }
}
