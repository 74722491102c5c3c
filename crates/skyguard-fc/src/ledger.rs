use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Arm,
    Disarm,
    Takeoff,
    Land,
    Rtl,
    TimedHold,
    WaypointMission,
}

impl CommandKind {
    /// Commands that move the vehicle; at most one may run at a time.
    pub fn is_flight(self) -> bool {
        matches!(
            self,
            CommandKind::Takeoff | CommandKind::Land | CommandKind::Rtl | CommandKind::TimedHold | CommandKind::WaypointMission
        )
    }

    pub fn conflicts_with(self, other: CommandKind) -> bool {
        use CommandKind::*;
        if self.is_flight() && other.is_flight() {
            return true;
        }
        matches!(
            (self, other),
            (Arm, Arm) | (Disarm, Disarm) | (Arm, Disarm) | (Disarm, Arm) | (Disarm, Takeoff) | (Takeoff, Disarm) | (Land, Arm) | (Arm, Land)
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandKind::Arm => "arm",
            CommandKind::Disarm => "disarm",
            CommandKind::Takeoff => "takeoff",
            CommandKind::Land => "land",
            CommandKind::Rtl => "rtl",
            CommandKind::TimedHold => "timed_hold",
            CommandKind::WaypointMission => "waypoint_mission",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{requested} rejected: {active} already in progress ({elapsed_s:.1}s)")]
pub struct Conflict {
    pub requested: CommandKind,
    pub active: CommandKind,
    pub elapsed_s: f64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    started: Instant,
    lease: Duration,
    ticket: u64,
}

/// Which commands are currently in flight, and since when.
///
/// An entry older than its lease is considered abandoned and dropped on the
/// next `begin`. The default lease is the command timeout; commands that
/// legitimately run longer pass their own worst-case bound.
#[derive(Debug)]
pub struct FlightCommandLedger {
    active: HashMap<CommandKind, Entry>,
    timeout: Duration,
    next_ticket: u64,
}

impl FlightCommandLedger {
    pub fn new(timeout: Duration) -> Self {
        Self { active: HashMap::new(), timeout, next_ticket: 1 }
    }

    /// Record `kind` as started, or refuse if it clashes with a live entry.
    /// The returned ticket releases exactly this entry.
    pub fn begin(&mut self, kind: CommandKind) -> Result<u64, Conflict> {
        self.begin_with_lease(kind, self.timeout)
    }

    pub fn begin_with_lease(&mut self, kind: CommandKind, lease: Duration) -> Result<u64, Conflict> {
        let lease = lease.max(self.timeout);
        let now = Instant::now();
        self.expire_stale(now);

        if let Some((active, e)) = self.active.iter().find(|(k, _)| kind.conflicts_with(**k)) {
            let c = Conflict { requested: kind, active: *active, elapsed_s: now.duration_since(e.started).as_secs_f64() };
            warn!(event = "command_conflict", requested = %kind, active = %active, elapsed_s = c.elapsed_s);
            return Err(c);
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.active.insert(kind, Entry { started: now, lease, ticket });
        Ok(ticket)
    }

    pub fn finish(&mut self, kind: CommandKind, ticket: u64) {
        if self.active.get(&kind).is_some_and(|e| e.ticket == ticket) {
            self.active.remove(&kind);
        }
    }

    /// Emergency commands invalidate every other in-flight command.
    pub fn clear_for_emergency(&mut self, reason: &str) {
        if !self.active.is_empty() {
            let cleared: Vec<String> = self.active.keys().map(|k| k.to_string()).collect();
            info!(event = "ledger_cleared", reason, cleared = ?cleared);
        }
        self.active.clear();
    }

    pub fn active_kinds(&self) -> Vec<CommandKind> {
        self.active.keys().copied().collect()
    }

    fn expire_stale(&mut self, now: Instant) {
        self.active.retain(|kind, e| {
            let keep = now.duration_since(e.started) <= e.lease;
            if !keep {
                warn!(event = "ledger_expired", kind = %kind, age_s = now.duration_since(e.started).as_secs_f64());
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flight_commands_are_mutually_exclusive() {
        let kinds = [CommandKind::Takeoff, CommandKind::Land, CommandKind::Rtl, CommandKind::TimedHold, CommandKind::WaypointMission];
        for a in kinds {
            for b in kinds {
                assert!(a.conflicts_with(b), "{} vs {}", a, b);
            }
        }
        assert!(!CommandKind::Arm.conflicts_with(CommandKind::Rtl));
        assert!(CommandKind::Arm.conflicts_with(CommandKind::Land));
        assert!(CommandKind::Disarm.conflicts_with(CommandKind::Takeoff));
    }

    #[tokio::test(start_paused = true)]
    async fn takeoff_rejected_while_land_active() {
        let mut l = FlightCommandLedger::new(Duration::from_secs(30));
        let land = l.begin(CommandKind::Land).unwrap();
        let err = l.begin(CommandKind::Takeoff).unwrap_err();
        assert_eq!(err.active, CommandKind::Land);

        l.finish(CommandKind::Land, land);
        assert!(l.begin(CommandKind::Takeoff).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_clears_everything() {
        let mut l = FlightCommandLedger::new(Duration::from_secs(30));
        l.begin(CommandKind::Land).unwrap();
        l.begin(CommandKind::Arm).unwrap_err();
        l.clear_for_emergency("emergency_land");
        assert!(l.active_kinds().is_empty());
        assert!(l.begin(CommandKind::Takeoff).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_expire() {
        let mut l = FlightCommandLedger::new(Duration::from_secs(30));
        l.begin(CommandKind::Rtl).unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(l.begin(CommandKind::Land).is_ok());
        assert!(!l.active_kinds().contains(&CommandKind::Rtl));
    }

    #[tokio::test(start_paused = true)]
    async fn long_lease_outlives_command_timeout() {
        let mut l = FlightCommandLedger::new(Duration::from_secs(30));
        l.begin_with_lease(CommandKind::WaypointMission, Duration::from_secs(600)).unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(l.begin(CommandKind::Rtl).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn old_ticket_does_not_release_new_entry() {
        let mut l = FlightCommandLedger::new(Duration::from_secs(30));
        let first = l.begin(CommandKind::Land).unwrap();
        l.clear_for_emergency("test");
        let _second = l.begin(CommandKind::Land).unwrap();
        l.finish(CommandKind::Land, first);
        assert_eq!(l.active_kinds(), vec![CommandKind::Land]);
    }
}
