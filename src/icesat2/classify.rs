//! ATL08 photon classification matched onto ATL03 photons.

use super::Atl08Class;

/// Signal photon table of an ATL08 granule track.
#[derive(Debug, Clone, Copy)]
pub struct Atl08Photons<'a> {
    /// ATL03 segment id of each classified photon
    pub segment_id: &'a [i32],
    /// 1-based index of the photon within its ATL03 segment
    pub classed_pc_indx: &'a [i32],
    pub classed_pc_flag: &'a [u8],
    /// Height above the interpolated ground surface
    pub ph_h: &'a [f32],
}

/// Class and relief of each ATL03 photon in a subset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotonClasses {
    pub class: Vec<u8>,
    pub relief: Vec<f32>,
}

/// Walks the ATL03 segments and the ATL08 photon table together, both sorted
/// by segment; photons without an ATL08 entry are unclassified.
pub fn classify_atl08(
    segment_id: &[i32],
    segment_ph_cnt: &[i32],
    num_photons: usize,
    atl08: &Atl08Photons<'_>,
) -> PhotonClasses {
    let mut out = PhotonClasses {
        class: vec![Atl08Class::Unclassified as u8; num_photons],
        relief: vec![0.0; num_photons],
    };
    let n08 = atl08.segment_id.len().min(atl08.classed_pc_indx.len()).min(atl08.classed_pc_flag.len());

    let mut atl08_ph = 0;
    let mut atl03_ph = 0;
    for (&seg_id, &count) in segment_id.iter().zip(segment_ph_cnt) {
        for index in 1..=count.max(0) {
            if atl03_ph >= num_photons {
                return out;
            }
            while atl08_ph < n08 && atl08.segment_id[atl08_ph] < seg_id {
                atl08_ph += 1;
            }
            while atl08_ph < n08
                && atl08.segment_id[atl08_ph] == seg_id
                && atl08.classed_pc_indx[atl08_ph] < index
            {
                atl08_ph += 1;
            }
            if atl08_ph < n08
                && atl08.segment_id[atl08_ph] == seg_id
                && atl08.classed_pc_indx[atl08_ph] == index
            {
                out.class[atl03_ph] = atl08.classed_pc_flag[atl08_ph];
                out.relief[atl03_ph] = atl08.ph_h.get(atl08_ph).copied().unwrap_or(0.0);
                atl08_ph += 1;
            }
            atl03_ph += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_by_segment_and_index() {
        let segment_id = [100, 101, 102];
        let segment_ph_cnt = [2, 3, 1];
        let atl08 = Atl08Photons {
            segment_id: &[99, 100, 100, 101, 102],
            classed_pc_indx: &[1, 1, 2, 2, 1],
            classed_pc_flag: &[1, 1, 2, 3, 0],
            ph_h: &[9.0, 0.5, 4.0, 12.0, -0.2],
        };
        let out = classify_atl08(&segment_id, &segment_ph_cnt, 6, &atl08);
        assert_eq!(out.class, vec![1, 2, 4, 3, 4, 0]);
        assert_eq!(out.relief, vec![0.5, 4.0, 0.0, 12.0, 0.0, -0.2]);
    }

    #[test]
    fn empty_atl08_leaves_everything_unclassified() {
        let atl08 = Atl08Photons { segment_id: &[], classed_pc_indx: &[], classed_pc_flag: &[], ph_h: &[] };
        let out = classify_atl08(&[7, 8], &[1, 2], 3, &atl08);
        assert!(out.class.iter().all(|&c| c == Atl08Class::Unclassified as u8));
    }
}
