use serde::{Deserialize, Serialize};
use skyguard_proto::WaypointInput;
use tracing::{debug, warn};

use crate::geo::{validate_coordinates, GeoPoint};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MissionWaypoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl MissionWaypoint {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// Bounds applied while turning operator input into flyable waypoints.
#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub default_alt_m: f64,
    pub min_alt_m: f64,
    pub max_alt_m: f64,
    pub min_separation_m: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessedWaypoints {
    pub waypoints: Vec<MissionWaypoint>,
    pub warnings: Vec<String>,
    pub skipped: usize,
    pub merged: usize,
}

/// Default and clamp altitudes, drop out-of-range coordinates, then merge
/// consecutive points closer than the minimum separation. Order is kept and
/// the first point of a merged run survives.
pub fn process_waypoints(input: &[WaypointInput], limits: &PipelineLimits) -> ProcessedWaypoints {
    let mut out = ProcessedWaypoints::default();

    for (i, wp) in input.iter().enumerate() {
        let n = i + 1;
        if let Err(e) = validate_coordinates(wp.lat, wp.lon) {
            warn!(event = "waypoint_skipped", waypoint = n, reason = %e);
            out.warnings.push(format!("skipped waypoint {}: {}", n, e));
            out.skipped += 1;
            continue;
        }

        let alt = match wp.alt {
            Some(a) if a.is_finite() && a > 0.0 => a,
            _ => {
                debug!(event = "waypoint_default_altitude", waypoint = n, alt_m = limits.default_alt_m);
                limits.default_alt_m
            }
        };
        let clamped = alt.clamp(limits.min_alt_m, limits.max_alt_m);
        if clamped != alt {
            out.warnings.push(format!("waypoint {}: altitude {:.1}m clamped to {:.1}m", n, alt, clamped));
        }
        let candidate = MissionWaypoint { lat: wp.lat, lon: wp.lon, alt: clamped };

        if let Some(prev) = out.waypoints.last() {
            let d = prev.point().distance_to(&candidate.point());
            if d < limits.min_separation_m {
                debug!(event = "waypoint_merged", waypoint = n, distance_m = d);
                out.warnings.push(format!(
                    "waypoint {} merged into previous ({:.2}m < {:.1}m)",
                    n, d, limits.min_separation_m
                ));
                out.merged += 1;
                continue;
            }
        }
        out.waypoints.push(candidate);
    }
    out
}

/// Plan-level checks run after processing. Errors reject the mission,
/// the returned strings are advisory.
pub fn validate_waypoint_list(
    waypoints: &[MissionWaypoint],
    max_waypoints: usize,
    home: Option<GeoPoint>,
    max_distance_from_home_m: f64,
) -> Result<Vec<String>, String> {
    if waypoints.is_empty() {
        return Err("no valid waypoints".to_string());
    }
    if waypoints.len() > max_waypoints {
        return Err(format!("too many waypoints: {} (max {})", waypoints.len(), max_waypoints));
    }

    let mut warnings = Vec::new();
    for (i, pair) in waypoints.windows(2).enumerate() {
        let d = pair[0].point().distance_to(&pair[1].point());
        if d < 1.0 {
            warnings.push(format!("waypoints {} and {} are {:.2}m apart", i + 1, i + 2, d));
        }
    }
    if let Some(home) = home {
        for (i, wp) in waypoints.iter().enumerate() {
            let d = home.distance_to(&wp.point());
            if d > max_distance_from_home_m {
                warnings.push(format!(
                    "waypoint {} is {:.0}m from home (limit {:.0}m)",
                    i + 1, d, max_distance_from_home_m
                ));
            }
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PipelineLimits {
        PipelineLimits { default_alt_m: 20.0, min_alt_m: 0.5, max_alt_m: 30.0, min_separation_m: 2.0 }
    }

    fn wp(lat: f64, lon: f64, alt: Option<f64>) -> WaypointInput {
        WaypointInput { lat, lon, alt }
    }

    #[test]
    fn merges_points_closer_than_separation() {
        let out = process_waypoints(&[wp(0.0, 0.0, Some(20.0)), wp(0.0, 0.0000095, Some(20.0))], &limits());
        assert_eq!(out.waypoints.len(), 1);
        assert_eq!(out.merged, 1);
        assert_eq!(out.waypoints[0].lon, 0.0);
    }

    #[test]
    fn keeps_points_beyond_separation() {
        let out = process_waypoints(&[wp(0.0, 0.0, Some(20.0)), wp(0.0, 0.0001, Some(20.0))], &limits());
        assert_eq!(out.waypoints.len(), 2);
    }

    #[test]
    fn defaults_and_clamps_altitude() {
        let out = process_waypoints(
            &[wp(1.0, 1.0, Some(0.0)), wp(1.001, 1.0, Some(500.0)), wp(1.002, 1.0, None), wp(1.003, 1.0, Some(-3.0))],
            &limits(),
        );
        let alts: Vec<f64> = out.waypoints.iter().map(|w| w.alt).collect();
        assert_eq!(alts, vec![20.0, 30.0, 20.0, 20.0]);
        assert!(out.warnings.iter().any(|w| w.contains("clamped to 30.0m")));
    }

    #[test]
    fn skips_out_of_range_without_aborting() {
        let out = process_waypoints(
            &[wp(91.0, 0.0, None), wp(10.0, 10.0, None), wp(10.0, 200.0, None), wp(10.001, 10.0, None)],
            &limits(),
        );
        assert_eq!(out.skipped, 2);
        assert_eq!(out.waypoints.len(), 2);
        assert_eq!(out.waypoints[0].lat, 10.0);
    }

    #[test]
    fn list_validation() {
        assert!(validate_waypoint_list(&[], 50, None, 100.0).is_err());

        let many: Vec<MissionWaypoint> =
            (0..51).map(|i| MissionWaypoint { lat: i as f64 * 0.001, lon: 0.0, alt: 20.0 }).collect();
        assert!(validate_waypoint_list(&many, 50, None, 100.0).unwrap_err().contains("max 50"));

        // closing the loop back to the start is fine, stuttering is not
        let looped = [
            MissionWaypoint { lat: 0.0, lon: 0.0, alt: 20.0 },
            MissionWaypoint { lat: 0.001, lon: 0.0, alt: 20.0 },
            MissionWaypoint { lat: 0.001, lon: 0.0000001, alt: 20.0 },
            MissionWaypoint { lat: 0.0, lon: 0.0, alt: 20.0 },
        ];
        let warnings = validate_waypoint_list(&looped, 50, Some(GeoPoint::new(0.0, 0.0)), 100.0).unwrap();
        assert!(warnings.iter().any(|w| w.starts_with("waypoints 2 and 3")));
        assert!(!warnings.iter().any(|w| w.starts_with("waypoints 1 and 4")));
        assert!(warnings.iter().any(|w| w.starts_with("waypoint 2 is 111m from home")));
    }
}
