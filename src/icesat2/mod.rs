//! ICESat-2 photon pipeline: ATL03 subsetting, ATL06 surface fits and
//! ATL08 canopy metrics.
//!
//! The [`reader::Atl03Reader`] turns granule datasets into extent records
//! ("atl03rec"). [`atl06::Atl06Dispatch`] and [`atl08::Atl08Dispatch`] are
//! dispatch handlers that consume extents and post batched results.

pub mod atl06;
pub mod atl08;
pub mod classify;
pub mod extent;
pub mod reader;
pub mod region;
pub mod yapc;

use serde::{Deserialize, Serialize};

use crate::record::RecordRegistry;
use crate::Result;

/// Nominal length of an ATL03 geolocation segment in meters.
pub const ATL03_SEGMENT_LENGTH: f64 = 20.0;

/// Marker for flags that were not populated.
pub const INVALID_FLAG: u8 = 0xFF;

/// Seconds from the GPS epoch to the ATLAS SDP epoch.
pub const ATLAS_SDP_EPOCH_GPS: i64 = 1_198_800_018;

pub const NUM_PAIR_TRACKS: usize = 2;
pub const PAIR_LEFT: usize = 0;
pub const PAIR_RIGHT: usize = 1;
pub const NUM_TRACKS: u8 = 3;

/// Extent id bit marking derived (elevation) products.
pub const EXTENT_ID_ELEVATION: u64 = 0x2;

pub const INVALID_SPOT: u8 = 0;
pub const INVALID_GT: u8 = 70;

/// Signal confidence bounds; values are offset by this amount to index masks.
pub const CNF_POSSIBLE_TEP: i8 = -2;
pub const CNF_SURFACE_HIGH: i8 = 4;
pub const SIGNAL_CONF_OFFSET: i8 = 2;
pub const NUM_SIGNAL_CONF: usize = 7;

pub const QUALITY_NOMINAL: i8 = 0;
pub const QUALITY_POSSIBLE_TEP: i8 = 3;
pub const NUM_PHOTON_QUALITY: usize = 4;

pub const NUM_ATL08_CLASSES: usize = 5;

/// Spacecraft orientation from `/orbit_info/sc_orient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Backward = 0,
    Forward = 1,
    Transition = 2,
}

impl Orientation {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Orientation::Backward),
            1 => Some(Orientation::Forward),
            2 => Some(Orientation::Transition),
            _ => None,
        }
    }
}

/// ATL08 photon classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atl08Class {
    Noise = 0,
    Ground = 1,
    Canopy = 2,
    TopOfCanopy = 3,
    Unclassified = 4,
}

impl Atl08Class {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Atl08Class::Noise),
            1 => Some(Atl08Class::Ground),
            2 => Some(Atl08Class::Canopy),
            3 => Some(Atl08Class::TopOfCanopy),
            4 => Some(Atl08Class::Unclassified),
            _ => None,
        }
    }

    pub fn is_ground(raw: u8) -> bool {
        raw == Atl08Class::Ground as u8
    }

    pub fn is_vegetation(raw: u8) -> bool {
        raw == Atl08Class::Canopy as u8 || raw == Atl08Class::TopOfCanopy as u8
    }
}

/// Column of `heights/signal_conf_ph` to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceType {
    #[default]
    #[serde(alias = "SRT_LAND")]
    Land = 0,
    #[serde(alias = "SRT_OCEAN")]
    Ocean = 1,
    #[serde(alias = "SRT_SEA_ICE")]
    SeaIce = 2,
    #[serde(alias = "SRT_LAND_ICE")]
    LandIce = 3,
    #[serde(alias = "SRT_INLAND_WATER")]
    InlandWater = 4,
}

impl SurfaceType {
    pub fn column(self) -> usize {
        self as usize
    }
}

/// Laser spot number (1..6) for a track/pair under the given orientation.
pub fn spot_number(orientation: Orientation, track: u8, pair: usize) -> u8 {
    if !(1..=NUM_TRACKS).contains(&track) || pair >= NUM_PAIR_TRACKS {
        return INVALID_SPOT;
    }
    let backward = (track - 1) * 2 + pair as u8 + 1;
    match orientation {
        Orientation::Backward => backward,
        Orientation::Forward => 7 - backward,
        Orientation::Transition => INVALID_SPOT,
    }
}

/// Ground track code (GT1L = 10 .. GT3R = 60).
pub fn ground_track(orientation: Orientation, track: u8, pair: usize) -> u8 {
    if !(1..=NUM_TRACKS).contains(&track) || pair >= NUM_PAIR_TRACKS {
        return INVALID_GT;
    }
    match orientation {
        Orientation::Transition => INVALID_GT,
        _ => ((track - 1) * 2 + pair as u8 + 1) * 10,
    }
}

/// Hoare quicksort with a middle pivot, ascending by `key`.
///
/// Recurses into the smaller partition and loops over the larger one.
pub(crate) fn quicksort_by<T, F>(mut items: &mut [T], key: F)
where
    F: Fn(&T) -> f64 + Copy,
{
    while items.len() > 1 {
        let split = partition(items, key);
        let (lower, upper) = items.split_at_mut(split + 1);
        if lower.len() < upper.len() {
            quicksort_by(lower, key);
            items = upper;
        } else {
            quicksort_by(upper, key);
            items = lower;
        }
    }
}

fn partition<T, F>(items: &mut [T], key: F) -> usize
where
    F: Fn(&T) -> f64,
{
    let pivot = key(&items[(items.len() - 1) / 2]);
    let mut i = 0;
    let mut j = items.len() - 1;
    loop {
        while key(&items[i]) < pivot {
            i += 1;
        }
        while key(&items[j]) > pivot {
            j -= 1;
        }
        if i >= j {
            return j;
        }
        items.swap(i, j);
        i += 1;
        j -= 1;
    }
}

/// Registers every ICESat-2 record type.
pub(crate) fn define_records(registry: &RecordRegistry) -> Result<()> {
    extent::define_records(registry)?;
    atl06::define_records(registry)?;
    atl08::define_records(registry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn spot_and_track_tables() {
        assert_eq!(spot_number(Orientation::Backward, 1, PAIR_LEFT), 1);
        assert_eq!(spot_number(Orientation::Backward, 3, PAIR_RIGHT), 6);
        assert_eq!(spot_number(Orientation::Forward, 1, PAIR_LEFT), 6);
        assert_eq!(spot_number(Orientation::Forward, 2, PAIR_RIGHT), 3);
        assert_eq!(spot_number(Orientation::Forward, 3, PAIR_RIGHT), 1);
        assert_eq!(spot_number(Orientation::Transition, 2, PAIR_LEFT), INVALID_SPOT);
        assert_eq!(spot_number(Orientation::Backward, 4, PAIR_LEFT), INVALID_SPOT);

        assert_eq!(ground_track(Orientation::Backward, 1, PAIR_LEFT), 10);
        assert_eq!(ground_track(Orientation::Forward, 1, PAIR_RIGHT), 20);
        assert_eq!(ground_track(Orientation::Forward, 3, PAIR_RIGHT), 60);
        assert_eq!(ground_track(Orientation::Transition, 3, PAIR_RIGHT), INVALID_GT);
    }

    #[test]
    fn class_predicates() {
        assert!(Atl08Class::is_ground(1));
        assert!(Atl08Class::is_vegetation(2));
        assert!(Atl08Class::is_vegetation(3));
        assert!(!Atl08Class::is_vegetation(4));
        assert_eq!(Atl08Class::from_raw(4), Some(Atl08Class::Unclassified));
        assert_eq!(Atl08Class::from_raw(5), None);
    }

    proptest! {
        #[test]
        fn quicksort_orders_by_key(mut values in prop::collection::vec(-1.0e3f64..1.0e3, 0..300)) {
            let mut expected = values.clone();
            expected.sort_by(f64::total_cmp);
            quicksort_by(&mut values, |&v| v);
            prop_assert_eq!(values, expected);
        }

        #[test]
        fn quicksort_sorts_indices(keys in prop::collection::vec(0u8..8, 1..100)) {
            let mut index: Vec<usize> = (0..keys.len()).collect();
            quicksort_by(&mut index, |&i| f64::from(keys[i]));
            for w in index.windows(2) {
                prop_assert!(keys[w[0]] <= keys[w[1]]);
            }
        }
    }
}
