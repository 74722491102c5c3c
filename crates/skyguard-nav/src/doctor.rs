use anyhow::Result;

use crate::geo::GeoPoint;
use crate::waypoint::PipelineLimits;

pub fn check_pipeline_limits(limits: &PipelineLimits) -> Result<()> {
    anyhow::ensure!(limits.min_alt_m > 0.0, "mission altitude floor must be above ground");
    anyhow::ensure!(limits.min_alt_m < limits.max_alt_m, "min altitude must be below max altitude");
    anyhow::ensure!(
        limits.default_alt_m >= limits.min_alt_m && limits.default_alt_m <= limits.max_alt_m,
        "mission.default_altitude_m {} outside {}..{}",
        limits.default_alt_m, limits.min_alt_m, limits.max_alt_m
    );
    anyhow::ensure!(
        limits.min_separation_m >= 0.5 && limits.min_separation_m <= 50.0,
        "mission.min_separation_m should be 0.5..50"
    );
    Ok(())
}

/// Planned home, when configured for dry runs, must be a real coordinate.
pub fn check_home(home: &GeoPoint) -> Result<()> {
    anyhow::ensure!(home.is_valid(), "home coordinates invalid");
    anyhow::ensure!(!home.is_null_island(), "home is the (0,0) placeholder");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_default_altitude_outside_bounds() {
        let mut l = PipelineLimits { default_alt_m: 20.0, min_alt_m: 0.5, max_alt_m: 30.0, min_separation_m: 2.0 };
        assert!(check_pipeline_limits(&l).is_ok());
        l.default_alt_m = 40.0;
        assert!(check_pipeline_limits(&l).is_err());
    }

    #[test]
    fn rejects_placeholder_home() {
        assert!(check_home(&GeoPoint::new(0.0, 0.0)).is_err());
        assert!(check_home(&GeoPoint::new(46.5, 6.6)).is_ok());
    }
}
