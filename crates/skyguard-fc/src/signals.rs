use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyCause {
    ConnectionLoss,
    LowBattery,
    GpsLoss,
    Operator,
}

impl fmt::Display for EmergencyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmergencyCause::ConnectionLoss => "connection_loss",
            EmergencyCause::LowBattery => "low_battery",
            EmergencyCause::GpsLoss => "gps_loss",
            EmergencyCause::Operator => "operator",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// Operator took manual control; foreground loops stop and hold.
    Override,
    Emergency(EmergencyCause),
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Override => f.write_str("manual override"),
            Interruption::Emergency(c) => write!(f, "emergency ({})", c),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SignalState {
    override_engaged: bool,
    emergency_epoch: u64,
    last_cause: Option<EmergencyCause>,
}

/// Session-wide override and emergency signals.
///
/// Override is a level that stays set until released. Emergencies are
/// counted: a [`SignalWatch`] remembers the count it started at and reports
/// any emergency raised after that.
#[derive(Debug, Clone)]
pub struct FlightSignals {
    tx: Arc<watch::Sender<SignalState>>,
}

impl Default for FlightSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl FlightSignals {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SignalState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn engage_override(&self) {
        self.tx.send_modify(|s| s.override_engaged = true);
        warn!(event = "override_engaged");
    }

    pub fn release_override(&self) {
        self.tx.send_modify(|s| s.override_engaged = false);
        info!(event = "override_released");
    }

    pub fn override_engaged(&self) -> bool {
        self.tx.borrow().override_engaged
    }

    pub fn raise_emergency(&self, cause: EmergencyCause) -> u64 {
        let mut epoch = 0;
        self.tx.send_modify(|s| {
            s.emergency_epoch += 1;
            s.last_cause = Some(cause);
            epoch = s.emergency_epoch;
        });
        error!(event = "emergency_raised", cause = %cause, epoch);
        epoch
    }

    pub fn watch(&self) -> SignalWatch {
        let rx = self.tx.subscribe();
        let epoch = rx.borrow().emergency_epoch;
        SignalWatch { rx, epoch }
    }
}

#[derive(Debug, Clone)]
pub struct SignalWatch {
    rx: watch::Receiver<SignalState>,
    epoch: u64,
}

impl SignalWatch {
    /// Emergency raised since this watch was taken.
    pub fn emergency(&self) -> Option<EmergencyCause> {
        let s = self.rx.borrow();
        if s.emergency_epoch != self.epoch {
            s.last_cause
        } else {
            None
        }
    }

    /// Emergency first, then override.
    pub fn interruption(&self) -> Option<Interruption> {
        if let Some(c) = self.emergency() {
            return Some(Interruption::Emergency(c));
        }
        if self.rx.borrow().override_engaged {
            return Some(Interruption::Override);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_sees_only_later_emergencies() {
        let s = FlightSignals::new();
        s.raise_emergency(EmergencyCause::LowBattery);
        let w = s.watch();
        assert_eq!(w.interruption(), None);

        s.raise_emergency(EmergencyCause::GpsLoss);
        assert_eq!(w.emergency(), Some(EmergencyCause::GpsLoss));
        assert_eq!(s.watch().emergency(), None);
    }

    #[test]
    fn emergency_outranks_override() {
        let s = FlightSignals::new();
        let w = s.watch();
        s.engage_override();
        assert_eq!(w.interruption(), Some(Interruption::Override));
        s.raise_emergency(EmergencyCause::Operator);
        assert_eq!(w.interruption(), Some(Interruption::Emergency(EmergencyCause::Operator)));
        s.release_override();
        assert!(!s.override_engaged());
    }
}
