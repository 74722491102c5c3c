use anyhow::Result;

use crate::state::{FlightMode, VehicleSnapshot};

/// Command and telemetry surface of one connected vehicle.
///
/// Commands are fire-and-forget: `Ok` only means the request was handed to
/// the transport. Whether the vehicle acted on it is learned by polling
/// [`VehicleLink::snapshot`].
pub trait VehicleLink: Send + Sync {
    fn snapshot(&self) -> VehicleSnapshot;

    fn set_mode(&self, mode: FlightMode) -> Result<()>;

    fn set_armed(&self, armed: bool) -> Result<()>;

    fn command_takeoff(&self, altitude_m: f64) -> Result<()>;

    fn command_goto(&self, lat: f64, lon: f64, alt_m: f64) -> Result<()>;

    /// `Some(pwm)` overrides the throttle channel, `None` hands it back to
    /// the radio.
    fn override_throttle(&self, pwm: Option<u16>) -> Result<()>;

    /// Connection string or other label for logs.
    fn describe(&self) -> String {
        "vehicle".to_string()
    }
}
