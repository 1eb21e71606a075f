//! Synthetic granules for tests and benchmarks.
//!
//! [`SyntheticGranule`] lays out the ATL03 (and optionally ATL08) datasets a
//! reader expects inside a [`MemoryFetcher`], with evenly spaced photons on a
//! surface described by a plain function of along-track distance.

#![cfg(any(test, feature = "benchmark"))]

use std::sync::Arc;

use crate::fetch::{MemoryFetcher, TypedArray};

/// Meters per degree of latitude used to place segments.
const METERS_PER_DEGREE: f64 = 111_000.0;

/// First segment's along-track distance from the equator crossing.
pub const FIRST_SEGMENT_DISTANCE: f64 = 1_000_000.0;

pub const SPACECRAFT_SPEED: f64 = 7000.0;
pub const BACKGROUND_RATE: f64 = 1.0e6;

/// Height model: height in meters at an along-track offset from the first segment.
pub type Surface = fn(f64) -> f64;

/// ATL08 model: `(classed_pc_flag, ph_h)` of a photon by its index in the track.
pub type Classifier = fn(usize) -> (u8, f32);

pub fn flat_surface(_x: f64) -> f64 {
    100.0
}

#[derive(Debug, Clone)]
pub struct SyntheticGranule {
    pub resource: String,
    /// Reference pair tracks present in the granule
    pub tracks: Vec<u8>,
    pub num_segments: usize,
    pub photons_per_segment: usize,
    pub rgt: u16,
    pub cycle: u16,
    pub orientation: u8,
    pub start_lat: f64,
    pub start_lon: f64,
    pub surface: Surface,
    /// Writes an ATL08 granule alongside when set
    pub classify: Option<Classifier>,
}

impl Default for SyntheticGranule {
    fn default() -> Self {
        Self {
            resource: "ATL03_20200101000000_01230605_005_01.h5".to_string(),
            tracks: vec![1, 2, 3],
            num_segments: 10,
            photons_per_segment: 10,
            rgt: 123,
            cycle: 6,
            orientation: 1,
            start_lat: 40.0,
            start_lon: -105.0,
            surface: flat_surface,
            classify: None,
        }
    }
}

impl SyntheticGranule {
    pub fn atl08_resource(&self) -> String {
        let mut name = self.resource.clone();
        name.replace_range(4..5, "8");
        name
    }

    /// Latitude of segment `s`.
    pub fn segment_lat(&self, s: usize) -> f64 {
        self.start_lat + (s as f64 * 20.0) / METERS_PER_DEGREE
    }

    pub fn num_photons(&self) -> usize {
        self.num_segments * self.photons_per_segment
    }

    /// Photon offsets inside a segment, centred in equal slots.
    fn photon_offset(&self, i: usize) -> f64 {
        (i as f64 + 0.5) * 20.0 / self.photons_per_segment as f64
    }

    pub fn fetcher(&self) -> Arc<MemoryFetcher> {
        let fetcher = MemoryFetcher::new();
        self.install(&fetcher);
        Arc::new(fetcher)
    }

    pub fn install(&self, fetcher: &MemoryFetcher) {
        let r = self.resource.as_str();
        fetcher.insert(r, "/orbit_info/sc_orient", TypedArray::I8(vec![self.orientation as i8]));
        fetcher.insert(r, "/ancillary_data/start_rgt", TypedArray::I32(vec![i32::from(self.rgt)]));
        fetcher.insert(r, "/ancillary_data/start_cycle", TypedArray::I32(vec![i32::from(self.cycle)]));
        for &track in &self.tracks {
            for (pair, side) in ["l", "r"].into_iter().enumerate() {
                self.install_beam(fetcher, &format!("gt{track}{side}"), pair);
            }
        }
    }

    fn install_beam(&self, fetcher: &MemoryFetcher, beam: &str, pair: usize) {
        let r = self.resource.as_str();
        let nseg = self.num_segments;
        let nph = self.num_photons();
        let lon = self.start_lon + pair as f64 * 0.001;
        let seconds_per_segment = 20.0 / SPACECRAFT_SPEED;

        let seg_lat: Vec<f64> = (0..nseg).map(|s| self.segment_lat(s)).collect();
        let seg_time: Vec<f64> = (0..nseg).map(|s| 1000.0 + s as f64 * seconds_per_segment).collect();
        let geo = |name: &str| format!("{beam}/geolocation/{name}");
        let heights = |name: &str| format!("{beam}/heights/{name}");

        fetcher.insert(r, &geo("reference_photon_lat"), TypedArray::F64(seg_lat.clone()));
        fetcher.insert(r, &geo("reference_photon_lon"), TypedArray::F64(vec![lon; nseg]));
        fetcher.insert(r, &geo("segment_ph_cnt"), TypedArray::I32(vec![self.photons_per_segment as i32; nseg]));
        fetcher.insert_2d(
            r,
            &geo("velocity_sc"),
            TypedArray::F32((0..nseg).flat_map(|_| [SPACECRAFT_SPEED as f32, 0.0, 0.0]).collect()),
            3,
        );
        fetcher.insert(r, &geo("delta_time"), TypedArray::F64(seg_time.clone()));
        fetcher.insert(r, &geo("segment_id"), TypedArray::I32((0..nseg).map(|s| 500_000 + s as i32).collect()));
        fetcher.insert(
            r,
            &geo("segment_dist_x"),
            TypedArray::F64((0..nseg).map(|s| FIRST_SEGMENT_DISTANCE + s as f64 * 20.0).collect()),
        );
        fetcher.insert(r, &geo("solar_elevation"), TypedArray::F32(vec![-5.0; nseg]));

        let mut along = Vec::with_capacity(nph);
        let mut h = Vec::with_capacity(nph);
        let mut lat = Vec::with_capacity(nph);
        let mut time = Vec::with_capacity(nph);
        for s in 0..nseg {
            for i in 0..self.photons_per_segment {
                let offset = self.photon_offset(i);
                along.push(offset as f32);
                h.push((self.surface)(s as f64 * 20.0 + offset) as f32);
                lat.push(seg_lat[s] + offset / METERS_PER_DEGREE);
                time.push(seg_time[s] + offset / SPACECRAFT_SPEED);
            }
        }
        fetcher.insert(r, &heights("dist_ph_along"), TypedArray::F32(along));
        fetcher.insert(r, &heights("h_ph"), TypedArray::F32(h));
        fetcher.insert(r, &heights("quality_ph"), TypedArray::I8(vec![0; nph]));
        fetcher.insert_2d(r, &heights("signal_conf_ph"), TypedArray::I8(vec![4; nph * 5]), 5);
        fetcher.insert(r, &heights("lat_ph"), TypedArray::F64(lat));
        fetcher.insert(r, &heights("lon_ph"), TypedArray::F64(vec![lon; nph]));
        fetcher.insert(r, &heights("delta_time"), TypedArray::F64(time));

        fetcher.insert(r, &format!("{beam}/bckgrd_atlas/delta_time"), TypedArray::F64(seg_time));
        fetcher.insert(r, &format!("{beam}/bckgrd_atlas/bckgrd_rate"), TypedArray::F32(vec![BACKGROUND_RATE as f32; nseg]));

        if let Some(classify) = self.classify {
            let atl08 = self.atl08_resource();
            let mut segment_id = Vec::with_capacity(nph);
            let mut index = Vec::with_capacity(nph);
            let mut flag = Vec::with_capacity(nph);
            let mut ph_h = Vec::with_capacity(nph);
            for s in 0..nseg {
                for i in 0..self.photons_per_segment {
                    let (class, relief) = classify(s * self.photons_per_segment + i);
                    segment_id.push(500_000 + s as i32);
                    index.push(i as i32 + 1);
                    flag.push(class);
                    ph_h.push(relief);
                }
            }
            let sp = |name: &str| format!("{beam}/signal_photons/{name}");
            fetcher.insert(&atl08, &sp("ph_segment_id"), TypedArray::I32(segment_id));
            fetcher.insert(&atl08, &sp("classed_pc_indx"), TypedArray::I32(index));
            fetcher.insert(&atl08, &sp("classed_pc_flag"), TypedArray::U8(flag));
            fetcher.insert(&atl08, &sp("ph_h"), TypedArray::F32(ph_h));
        }
    }
}
