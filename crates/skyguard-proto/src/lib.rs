//! Value types exchanged with the command-dispatch layer: typed commands,
//! structured results and asynchronous flight events.

pub mod command;
pub mod events;

pub use command::{
    CommandResult, EmergencyChoice, FlightCommand, PostMissionAction, Status, WaypointInput,
};
pub use events::{EmergencyResolution, FlightEvent, StampedEvent, TakeoffStage};
