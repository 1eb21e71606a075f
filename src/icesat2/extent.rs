//! Extent records ("atl03rec"): the photons of one along-track window for
//! both tracks of a beam pair.

use crate::record::{
    Field, FieldFlags, FieldType, RecordDefinition, RecordObject, RecordRegistry, SchemaBuilder,
};
use crate::{Result, TracklineError};

use super::{NUM_PAIR_TRACKS, PAIR_LEFT, PAIR_RIGHT};

pub const ATL03_REC_TYPE: &str = "atl03rec";
pub const PHOTON_REC_TYPE: &str = "atl03rec.photons";

pub(crate) fn define_records(registry: &RecordRegistry) -> Result<()> {
    let photon = registry.define_with(
        SchemaBuilder::new(PHOTON_REC_TYPE)
            .field("delta_time", FieldType::Double, 1)
            .flags(FieldFlags::TIME)
            .field("latitude", FieldType::Double, 1)
            .flags(FieldFlags::Y_COORD)
            .field("longitude", FieldType::Double, 1)
            .flags(FieldFlags::X_COORD)
            .field("distance", FieldType::Double, 1)
            .field("height", FieldType::Float, 1)
            .flags(FieldFlags::Z_COORD)
            .field("relief", FieldType::Float, 1)
            .field("atl08_class", FieldType::UInt8, 1)
            .field("atl03_cnf", FieldType::Int8, 1)
            .field("quality_ph", FieldType::Int8, 1)
            .field("yapc_score", FieldType::UInt8, 1)
            .field("landcover", FieldType::UInt8, 1)
            .field("snowcover", FieldType::UInt8, 1),
    )?;
    registry.define_with(
        SchemaBuilder::new(ATL03_REC_TYPE)
            .field("valid", FieldType::UInt8, NUM_PAIR_TRACKS)
            .field("segment_id", FieldType::UInt32, NUM_PAIR_TRACKS)
            .field("segment_distance", FieldType::Double, NUM_PAIR_TRACKS)
            .field("extent_length", FieldType::Double, NUM_PAIR_TRACKS)
            .field("spacecraft_velocity", FieldType::Float, NUM_PAIR_TRACKS)
            .field("background_rate", FieldType::Double, NUM_PAIR_TRACKS)
            .field("solar_elevation", FieldType::Float, NUM_PAIR_TRACKS)
            .field("photon_count", FieldType::UInt32, NUM_PAIR_TRACKS)
            .field("photon_offset", FieldType::UInt32, NUM_PAIR_TRACKS)
            .field("reference_pair_track", FieldType::UInt8, 1)
            .field("spacecraft_orientation", FieldType::UInt8, 1)
            .field("reference_ground_track_start", FieldType::UInt16, 1)
            .field("cycle_start", FieldType::UInt16, 1)
            .field("extent_id", FieldType::UInt64, 1)
            .user("photons", &photon, 0)
            .id_field("extent_id"),
    )?;
    Ok(())
}

/// Extent id: `[RGT 63-52][CYCLE 51-36][RPT 35-34][COUNTER 33-2][ELEVATION 1][RIGHT 0]`.
pub fn extent_id(rgt: u16, cycle: u16, track: u8, counter: u32) -> u64 {
    ((u64::from(rgt) & 0xFFF) << 52)
        | (u64::from(cycle) << 36)
        | ((u64::from(track) & 0x3) << 34)
        | ((u64::from(counter) & 0xFFFF_FFFF) << 2)
}

/// One photon as carried inside an extent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Photon {
    /// Seconds since the ATLAS SDP epoch
    pub delta_time: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Along-track distance from the extent centre
    pub distance: f64,
    pub height: f32,
    /// Height above the ATL08 ground surface
    pub relief: f32,
    pub atl08_class: u8,
    pub atl03_cnf: i8,
    pub quality_ph: i8,
    pub yapc_score: u8,
    pub landcover: u8,
    pub snowcover: u8,
}

/// Per-track half of an extent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PairExtent {
    pub valid: bool,
    pub segment_id: u32,
    pub segment_distance: f64,
    pub extent_length: f64,
    pub spacecraft_velocity: f32,
    pub background_rate: f64,
    pub solar_elevation: f32,
    pub photons: Vec<Photon>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extent {
    pub reference_pair_track: u8,
    pub spacecraft_orientation: u8,
    pub reference_ground_track: u16,
    pub cycle: u16,
    pub extent_id: u64,
    pub pairs: [PairExtent; NUM_PAIR_TRACKS],
}

fn resolve(def: &RecordDefinition, path: &str) -> Result<Field> {
    def.resolve(path).ok_or_else(|| TracklineError::invalid_field(def.name(), path))
}

struct PhotonLayout {
    array: Field,
    delta_time: Field,
    latitude: Field,
    longitude: Field,
    distance: Field,
    height: Field,
    relief: Field,
    atl08_class: Field,
    atl03_cnf: Field,
    quality_ph: Field,
    yapc_score: Field,
    landcover: Field,
    snowcover: Field,
}

impl PhotonLayout {
    fn new(extent: &RecordDefinition) -> Result<Self> {
        let array = resolve(extent, "photons")?;
        let def = array
            .subtype
            .clone()
            .ok_or_else(|| TracklineError::invalid_field(extent.name(), "photons"))?;
        Ok(Self {
            delta_time: resolve(&def, "delta_time")?,
            latitude: resolve(&def, "latitude")?,
            longitude: resolve(&def, "longitude")?,
            distance: resolve(&def, "distance")?,
            height: resolve(&def, "height")?,
            relief: resolve(&def, "relief")?,
            atl08_class: resolve(&def, "atl08_class")?,
            atl03_cnf: resolve(&def, "atl03_cnf")?,
            quality_ph: resolve(&def, "quality_ph")?,
            yapc_score: resolve(&def, "yapc_score")?,
            landcover: resolve(&def, "landcover")?,
            snowcover: resolve(&def, "snowcover")?,
            array,
        })
    }

    fn stride(&self) -> usize {
        self.array.element_size()
    }

    fn write(&self, rec: &mut RecordObject, i: usize, p: &Photon) -> Result<()> {
        let a = &self.array;
        rec.set(&a.member(i, &self.delta_time), 0, p.delta_time)?;
        rec.set(&a.member(i, &self.latitude), 0, p.latitude)?;
        rec.set(&a.member(i, &self.longitude), 0, p.longitude)?;
        rec.set(&a.member(i, &self.distance), 0, p.distance)?;
        rec.set(&a.member(i, &self.height), 0, p.height)?;
        rec.set(&a.member(i, &self.relief), 0, p.relief)?;
        rec.set(&a.member(i, &self.atl08_class), 0, p.atl08_class)?;
        rec.set(&a.member(i, &self.atl03_cnf), 0, p.atl03_cnf)?;
        rec.set(&a.member(i, &self.quality_ph), 0, p.quality_ph)?;
        rec.set(&a.member(i, &self.yapc_score), 0, p.yapc_score)?;
        rec.set(&a.member(i, &self.landcover), 0, p.landcover)?;
        rec.set(&a.member(i, &self.snowcover), 0, p.snowcover)
    }

    fn read(&self, rec: &RecordObject, i: usize) -> Result<Photon> {
        let a = &self.array;
        Ok(Photon {
            delta_time: rec.get(&a.member(i, &self.delta_time), 0)?,
            latitude: rec.get(&a.member(i, &self.latitude), 0)?,
            longitude: rec.get(&a.member(i, &self.longitude), 0)?,
            distance: rec.get(&a.member(i, &self.distance), 0)?,
            height: rec.get(&a.member(i, &self.height), 0)?,
            relief: rec.get(&a.member(i, &self.relief), 0)?,
            atl08_class: rec.get(&a.member(i, &self.atl08_class), 0)?,
            atl03_cnf: rec.get(&a.member(i, &self.atl03_cnf), 0)?,
            quality_ph: rec.get(&a.member(i, &self.quality_ph), 0)?,
            yapc_score: rec.get(&a.member(i, &self.yapc_score), 0)?,
            landcover: rec.get(&a.member(i, &self.landcover), 0)?,
            snowcover: rec.get(&a.member(i, &self.snowcover), 0)?,
        })
    }
}

impl Extent {
    pub fn photon_count(&self) -> usize {
        self.pairs.iter().map(|p| p.photons.len()).sum()
    }

    /// Encodes into an "atl03rec" with the left photons followed by the right.
    pub fn to_record(&self, registry: &RecordRegistry) -> Result<RecordObject> {
        let def = registry.get(ATL03_REC_TYPE)?;
        let layout = PhotonLayout::new(&def)?;
        let size = layout.array.offset + self.photon_count() * layout.stride();
        let mut rec = RecordObject::with_size(registry, ATL03_REC_TYPE, size)?;

        let mut index = 0;
        for (t, pair) in self.pairs.iter().enumerate() {
            rec.set_integer("valid", t, i64::from(pair.valid))?;
            rec.set_integer("segment_id", t, i64::from(pair.segment_id))?;
            rec.set_real("segment_distance", t, pair.segment_distance)?;
            rec.set_real("extent_length", t, pair.extent_length)?;
            rec.set_real("spacecraft_velocity", t, f64::from(pair.spacecraft_velocity))?;
            rec.set_real("background_rate", t, pair.background_rate)?;
            rec.set_real("solar_elevation", t, f64::from(pair.solar_elevation))?;
            rec.set_integer("photon_count", t, pair.photons.len() as i64)?;
            let offset = layout.array.offset + index * layout.stride();
            rec.set_integer("photon_offset", t, offset as i64)?;
            for photon in &pair.photons {
                layout.write(&mut rec, index, photon)?;
                index += 1;
            }
        }

        rec.set_integer("reference_pair_track", 0, i64::from(self.reference_pair_track))?;
        rec.set_integer("spacecraft_orientation", 0, i64::from(self.spacecraft_orientation))?;
        rec.set_integer("reference_ground_track_start", 0, i64::from(self.reference_ground_track))?;
        rec.set_integer("cycle_start", 0, i64::from(self.cycle))?;
        rec.set_integer("extent_id", 0, self.extent_id as i64)?;
        Ok(rec)
    }

    /// Decodes an "atl03rec", following each pair's photon offset.
    pub fn from_record(rec: &RecordObject) -> Result<Self> {
        if !rec.is_type(ATL03_REC_TYPE) {
            return Err(TracklineError::invalid_data(
                "extent",
                format!("record type '{}' is not an extent", rec.record_type()),
            ));
        }
        let layout = PhotonLayout::new(rec.definition())?;
        let stride = layout.stride();

        let mut extent = Extent {
            reference_pair_track: rec.get_integer("reference_pair_track", 0)? as u8,
            spacecraft_orientation: rec.get_integer("spacecraft_orientation", 0)? as u8,
            reference_ground_track: rec.get_integer("reference_ground_track_start", 0)? as u16,
            cycle: rec.get_integer("cycle_start", 0)? as u16,
            extent_id: rec.get_integer("extent_id", 0)? as u64,
            ..Extent::default()
        };

        for t in [PAIR_LEFT, PAIR_RIGHT] {
            let count = rec.get_integer("photon_count", t)? as usize;
            let offset = rec.get_integer("photon_offset", t)? as usize;
            let end = offset + count * stride;
            if count > 0 && (offset < layout.array.offset || end > rec.allocated_size()) {
                return Err(TracklineError::invalid_data(
                    "extent",
                    format!("photons {offset}..{end} outside {} byte record", rec.allocated_size()),
                ));
            }
            let first = offset.saturating_sub(layout.array.offset) / stride;
            let photons = (first..first + count)
                .map(|i| layout.read(rec, i))
                .collect::<Result<Vec<_>>>()?;

            extent.pairs[t] = PairExtent {
                valid: rec.get_integer("valid", t)? != 0,
                segment_id: rec.get_integer("segment_id", t)? as u32,
                segment_distance: rec.get_real("segment_distance", t)?,
                extent_length: rec.get_real("extent_length", t)?,
                spacecraft_velocity: rec.get_real("spacecraft_velocity", t)? as f32,
                background_rate: rec.get_real("background_rate", t)?,
                solar_elevation: rec.get_real("solar_elevation", t)? as f32,
                photons,
            };
        }
        Ok(extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SerialMode;

    fn photon(h: f32) -> Photon {
        Photon {
            delta_time: 1000.5,
            latitude: 61.2,
            longitude: -149.9,
            distance: -3.25,
            height: h,
            relief: 1.5,
            atl08_class: 2,
            atl03_cnf: 4,
            quality_ph: 0,
            yapc_score: 200,
            landcover: 0xFF,
            snowcover: 0xFF,
        }
    }

    #[test]
    fn extent_id_packs_fields() {
        let id = extent_id(1234, 12, 2, 77);
        assert_eq!(id >> 52, 1234);
        assert_eq!((id >> 36) & 0xFFFF, 12);
        assert_eq!((id >> 34) & 0x3, 2);
        assert_eq!((id >> 2) & 0xFFFF_FFFF, 77);
        assert_eq!(id & 0x3, 0);
        assert_eq!(extent_id(1, 1, 3, 0) & (0x3 << 34), 0x3 << 34);
    }

    #[test]
    fn extent_survives_the_wire() {
        let registry = RecordRegistry::with_builtin_records().unwrap();
        let mut extent = Extent {
            reference_pair_track: 2,
            spacecraft_orientation: 1,
            reference_ground_track: 1234,
            cycle: 12,
            extent_id: extent_id(1234, 12, 2, 5),
            ..Extent::default()
        };
        extent.pairs[PAIR_LEFT] = PairExtent {
            valid: true,
            segment_id: 555_001,
            segment_distance: 1.1e7,
            extent_length: 40.0,
            spacecraft_velocity: 7000.0,
            background_rate: 1.5e6,
            solar_elevation: -12.5,
            photons: vec![photon(10.0), photon(11.0)],
        };
        extent.pairs[PAIR_RIGHT] = PairExtent {
            valid: false,
            photons: vec![photon(20.0)],
            ..PairExtent::default()
        };

        let rec = extent.to_record(&registry).unwrap();
        assert_eq!(rec.get_integer("photon_count", PAIR_RIGHT).unwrap(), 1);
        assert!(rec.allocated_size() > rec.declared_size());
        assert_eq!(rec.record_id(), Some(extent.extent_id as i64));

        let wire = rec.serialize(SerialMode::Copy).into_owned();
        let back = RecordObject::deserialize(&registry, &wire).unwrap();
        assert_eq!(Extent::from_record(&back).unwrap(), extent);
        assert_eq!(back.get_real("photons[2].height", 0).unwrap(), 20.0);
    }

    #[test]
    fn truncated_photons_are_rejected() {
        let registry = RecordRegistry::with_builtin_records().unwrap();
        let mut rec = RecordObject::new(&registry, ATL03_REC_TYPE).unwrap();
        rec.set_integer("photon_count", PAIR_LEFT, 4).unwrap();
        let offset = rec.declared_size() as i64;
        rec.set_integer("photon_offset", PAIR_LEFT, offset).unwrap();
        assert!(Extent::from_record(&rec).is_err());
    }
}
