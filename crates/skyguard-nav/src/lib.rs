//! Navigation primitives: spherical geodesy, waypoint processing and the
//! mission plan model. Nothing here talks to a vehicle.

pub mod doctor;
pub mod geo;
pub mod mission;
pub mod waypoint;

pub use geo::{bearing_deg, haversine_m, midpoint, GeoPoint};
pub use mission::{BoundingBox, Mission, MissionStats, MissionStatus};
pub use waypoint::{process_waypoints, validate_waypoint_list, MissionWaypoint, PipelineLimits, ProcessedWaypoints};
