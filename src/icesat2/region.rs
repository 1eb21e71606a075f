//! Spatial subsetting of a track's geolocation segments.

use tracing::debug;

use crate::config::Coord;
use crate::{Result, TracklineError};

/// Planar projection used for point-in-polygon tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    PlateCarree,
    NorthPolar,
    SouthPolar,
}

impl Projection {
    /// Projection suited to a track starting at `latitude`.
    pub fn for_latitude(latitude: f64) -> Self {
        if latitude > 70.0 {
            Projection::NorthPolar
        } else if latitude < -70.0 {
            Projection::SouthPolar
        } else {
            Projection::PlateCarree
        }
    }

    /// `(x, y)` of a coordinate in degrees.
    pub fn project(self, lat: f64, lon: f64) -> (f64, f64) {
        let (lat_rad, lon_rad) = (lat.to_radians(), lon.to_radians());
        let (r, o) = match self {
            Projection::PlateCarree => return (lon, lat),
            Projection::NorthPolar => (2.0 * (std::f64::consts::FRAC_PI_4 - lat_rad / 2.0).tan(), lon_rad),
            Projection::SouthPolar => {
                (-2.0 * (-std::f64::consts::FRAC_PI_4 - lat_rad / 2.0).tan(), -lon_rad)
            }
        };
        (r * o.cos(), r * o.sin())
    }
}

/// Polygon projected once for repeated inclusion tests.
#[derive(Debug, Clone)]
pub struct PolygonRegion {
    projection: Projection,
    points: Vec<(f64, f64)>,
}

impl PolygonRegion {
    pub fn new(polygon: &[Coord], projection: Projection) -> Self {
        let points = polygon.iter().map(|c| projection.project(c.lat, c.lon)).collect();
        Self { projection, points }
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    /// Even-odd rule test.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let (x, y) = self.projection.project(lat, lon);
        let n = self.points.len();
        let mut inside = false;
        let mut j = n.wrapping_sub(1);
        for i in 0..n {
            let (xi, yi) = self.points[i];
            let (xj, yj) = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// Raster inclusion test evaluated at each segment's reference photon.
pub trait RasterRegion: Send + Sync {
    fn includes(&self, lat: f64, lon: f64) -> bool;
}

impl<F> RasterRegion for F
where
    F: Fn(f64, f64) -> bool + Send + Sync,
{
    fn includes(&self, lat: f64, lon: f64) -> bool {
        self(lat, lon)
    }
}

/// Segment and photon ranges of a track that fall inside the region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    pub first_segment: usize,
    pub num_segments: usize,
    pub first_photon: usize,
    pub num_photons: usize,
    /// Per-segment inclusion, starting at `first_segment` (raster regions only)
    pub inclusion_mask: Option<Vec<bool>>,
}

impl Region {
    /// Every segment and photon of the track.
    pub fn full(segment_ph_cnt: &[i32], resource: &str) -> Result<Self> {
        let num_photons = segment_ph_cnt.iter().map(|&c| c.max(0) as usize).sum();
        Self {
            first_segment: 0,
            num_segments: segment_ph_cnt.len(),
            first_photon: 0,
            num_photons,
            inclusion_mask: None,
        }
        .non_empty(resource)
    }

    /// Contiguous run of segments from the first one inside `polygon` to the
    /// first later one outside it.
    pub fn polygon(
        lat: &[f64],
        lon: &[f64],
        segment_ph_cnt: &[i32],
        polygon: &PolygonRegion,
        resource: &str,
    ) -> Result<Self> {
        let mut region = Region::default();
        let mut found = false;
        let mut segment = 0;
        while segment < segment_ph_cnt.len() {
            let count = segment_ph_cnt[segment].max(0) as usize;
            let inside = count != 0 && polygon.contains(lat[segment], lon[segment]);
            if !found {
                if inside {
                    found = true;
                    region.first_segment = segment;
                    region.num_photons = count;
                } else {
                    region.first_photon += count;
                }
            } else if !inside && count != 0 {
                break;
            } else {
                region.num_photons += count;
            }
            segment += 1;
        }
        if found {
            region.num_segments = segment - region.first_segment;
        }
        region.non_empty(resource)
    }

    /// Segments from the first to the last one the raster includes, with a
    /// per-segment inclusion mask.
    pub fn raster(
        lat: &[f64],
        lon: &[f64],
        segment_ph_cnt: &[i32],
        raster: &dyn RasterRegion,
        resource: &str,
    ) -> Result<Self> {
        let mut region = Region::default();
        let mut mask = vec![false; segment_ph_cnt.len()];
        let mut found = false;
        let mut last_segment = 0;
        let mut running = 0;
        for (segment, &count) in segment_ph_cnt.iter().enumerate() {
            let count = count.max(0) as usize;
            if count == 0 {
                continue;
            }
            let inside = raster.includes(lat[segment], lon[segment]);
            mask[segment] = inside;
            if !found {
                if inside {
                    found = true;
                    region.first_segment = segment;
                    last_segment = segment;
                    running = count;
                    region.num_photons = running;
                } else {
                    region.first_photon += count;
                }
            } else {
                running += count;
                if inside {
                    region.num_photons = running;
                    last_segment = segment;
                }
            }
        }
        if found {
            region.num_segments = last_segment - region.first_segment + 1;
            mask.truncate(last_segment + 1);
            mask.drain(..region.first_segment);
            region.inclusion_mask = Some(mask);
        }
        region.non_empty(resource)
    }

    /// Whether subset segment `segment` passes the inclusion mask.
    pub fn includes_segment(&self, segment: usize) -> bool {
        match &self.inclusion_mask {
            Some(mask) => mask.get(segment).copied().unwrap_or(false),
            None => true,
        }
    }

    fn non_empty(self, resource: &str) -> Result<Self> {
        if self.num_photons == 0 {
            debug!(resource, "no photons inside region");
            return Err(TracklineError::EmptySpatialSubset { resource: resource.to_string() });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(lat0: f64, lat1: f64, lon0: f64, lon1: f64) -> Vec<Coord> {
        vec![
            Coord { lat: lat0, lon: lon0 },
            Coord { lat: lat0, lon: lon1 },
            Coord { lat: lat1, lon: lon1 },
            Coord { lat: lat1, lon: lon0 },
            Coord { lat: lat0, lon: lon0 },
        ]
    }

    fn track() -> (Vec<f64>, Vec<f64>, Vec<i32>) {
        let lat: Vec<f64> = (0..10).map(|i| 40.0 + i as f64 * 0.1).collect();
        let lon = vec![-105.0; 10];
        let cnt = vec![3, 0, 2, 4, 0, 5, 1, 2, 3, 1];
        (lat, lon, cnt)
    }

    #[test]
    fn projection_choice_and_pole() {
        assert_eq!(Projection::for_latitude(71.0), Projection::NorthPolar);
        assert_eq!(Projection::for_latitude(-70.5), Projection::SouthPolar);
        assert_eq!(Projection::for_latitude(70.0), Projection::PlateCarree);
        let (x, y) = Projection::NorthPolar.project(90.0, 45.0);
        assert!(x.abs() < 1e-12 && y.abs() < 1e-12);
        let (x, y) = Projection::SouthPolar.project(-90.0, 10.0);
        assert!(x.abs() < 1e-12 && y.abs() < 1e-12);
        assert_eq!(Projection::PlateCarree.project(10.0, 20.0), (20.0, 10.0));
    }

    #[test]
    fn polar_polygon_contains_pole_region() {
        let poly = PolygonRegion::new(
            &[
                Coord { lat: 80.0, lon: 0.0 },
                Coord { lat: 80.0, lon: 90.0 },
                Coord { lat: 80.0, lon: 180.0 },
                Coord { lat: 80.0, lon: -90.0 },
            ],
            Projection::NorthPolar,
        );
        assert!(poly.contains(85.0, 33.0));
        assert!(!poly.contains(75.0, 33.0));
    }

    #[test]
    fn polygon_subset_spans_first_inside_to_first_outside() {
        let (lat, lon, cnt) = track();
        // covers segments 2..=5 (lat 40.2 .. 40.5)
        let poly = PolygonRegion::new(&square(40.15, 40.55, -106.0, -104.0), Projection::PlateCarree);
        let region = Region::polygon(&lat, &lon, &cnt, &poly, "g").unwrap();
        assert_eq!(region.first_segment, 2);
        assert_eq!(region.first_photon, 3);
        assert_eq!(region.num_segments, 4);
        assert_eq!(region.num_photons, 2 + 4 + 0 + 5);
        assert!(region.includes_segment(0));
    }

    #[test]
    fn polygon_outside_track_is_empty() {
        let (lat, lon, cnt) = track();
        let poly = PolygonRegion::new(&square(10.0, 11.0, 0.0, 1.0), Projection::PlateCarree);
        assert!(matches!(
            Region::polygon(&lat, &lon, &cnt, &poly, "g"),
            Err(TracklineError::EmptySpatialSubset { .. })
        ));
    }

    #[test]
    fn raster_subset_keeps_mask_from_first_included() {
        let (lat, lon, cnt) = track();
        // includes segments 3 and 6 only
        let raster = |lat: f64, _lon: f64| (lat - 40.3).abs() < 1e-9 || (lat - 40.6).abs() < 1e-9;
        let region = Region::raster(&lat, &lon, &cnt, &raster, "g").unwrap();
        assert_eq!(region.first_segment, 3);
        assert_eq!(region.first_photon, 5);
        assert_eq!(region.num_segments, 4);
        assert_eq!(region.num_photons, 4 + 5 + 1);
        assert_eq!(region.inclusion_mask.as_deref(), Some(&[true, false, false, true][..]));
        assert!(!region.includes_segment(2));
    }

    #[test]
    fn full_region_counts_everything() {
        let (_, _, cnt) = track();
        let region = Region::full(&cnt, "g").unwrap();
        assert_eq!(region.num_segments, 10);
        assert_eq!(region.num_photons, 21);
        assert!(Region::full(&[0, 0], "g").is_err());
    }
}
