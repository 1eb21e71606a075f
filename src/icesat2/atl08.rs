//! ATL08-style vegetation metrics (PhoREAL) over extents.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::extent::{ATL03_REC_TYPE, Extent, Photon};
use super::{
    Atl08Class, EXTENT_ID_ELEVATION, INVALID_FLAG, NUM_PAIR_TRACKS, Orientation, ground_track, quicksort_by,
    spot_number,
};
use crate::config::{GeoLocation, Icesat2Params, PhorealParams};
use crate::dispatch::DispatchHandler;
use crate::msgq::{MsgQueues, PostError, Publisher, SYS_TIMEOUT};
use crate::record::{
    Field, FieldFlags, FieldType, RecordDefinition, RecordObject, RecordRegistry, SchemaBuilder, SerialMode,
};
use crate::stats::{Counters, StatsSnapshot};
use crate::{Result, TracklineError};

pub const VEGETATION_REC_TYPE: &str = "atl08rec.vegetation";
pub const ATL08_REC_TYPE: &str = "atl08rec";
pub const WAVEFORM_REC_TYPE: &str = "waverec";

pub const BATCH_SIZE: usize = 256;
pub const MAX_BINS: usize = 1000;
pub const NUM_PERCENTILES: usize = 19;
pub const PERCENTILE_INTERVAL: [f64; NUM_PERCENTILES] =
    [5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 55.0, 60.0, 65.0, 70.0, 75.0, 80.0, 85.0, 90.0, 95.0];
/// Percentile reported as the canopy height.
pub const CANOPY_HEIGHT_PERCENTILE: f64 = 98.0;

pub const BIN_UNDERFLOW_FLAG: u16 = 0x0001;
pub const BIN_OVERFLOW_FLAG: u16 = 0x0002;

pub(crate) fn define_records(registry: &RecordRegistry) -> Result<()> {
    let vegetation = registry.define_with(
        SchemaBuilder::new(VEGETATION_REC_TYPE)
            .field("extent_id", FieldType::UInt64, 1)
            .field("segment_id", FieldType::UInt32, 1)
            .field("rgt", FieldType::UInt16, 1)
            .field("cycle", FieldType::UInt16, 1)
            .field("spot", FieldType::UInt8, 1)
            .field("gt", FieldType::UInt8, 1)
            .field("ph_count", FieldType::UInt32, 1)
            .field("gnd_ph_count", FieldType::UInt32, 1)
            .field("veg_ph_count", FieldType::UInt32, 1)
            .field("landcover", FieldType::UInt8, 1)
            .field("snowcover", FieldType::UInt8, 1)
            .field("pflags", FieldType::UInt16, 1)
            .field("delta_time", FieldType::Double, 1)
            .flags(FieldFlags::TIME)
            .field("latitude", FieldType::Double, 1)
            .flags(FieldFlags::Y_COORD)
            .field("longitude", FieldType::Double, 1)
            .flags(FieldFlags::X_COORD)
            .field("x_atc", FieldType::Double, 1)
            .field("solar_elevation", FieldType::Float, 1)
            .field("h_te_median", FieldType::Float, 1)
            .field("h_max_canopy", FieldType::Float, 1)
            .field("h_min_canopy", FieldType::Float, 1)
            .field("h_mean_canopy", FieldType::Float, 1)
            .field("h_canopy", FieldType::Float, 1)
            .field("canopy_openness", FieldType::Float, 1)
            .field("canopy_h_metrics", FieldType::Float, NUM_PERCENTILES)
            .id_field("extent_id"),
    )?;
    registry.define_with(SchemaBuilder::new(ATL08_REC_TYPE).batch("vegetation", &vegetation))?;
    registry.define_with(
        SchemaBuilder::new(WAVEFORM_REC_TYPE)
            .field("extent_id", FieldType::UInt64, 1)
            .field("num_bins", FieldType::UInt16, 1)
            .field("binsize", FieldType::Float, 1)
            .field("waveform", FieldType::Float, 0)
            .id_field("extent_id"),
    )?;
    Ok(())
}

/// Vegetation statistics of one pair track.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Vegetation {
    pub extent_id: u64,
    pub segment_id: u32,
    pub rgt: u16,
    pub cycle: u16,
    pub spot: u8,
    pub gt: u8,
    pub ph_count: u32,
    pub gnd_ph_count: u32,
    pub veg_ph_count: u32,
    pub landcover: u8,
    pub snowcover: u8,
    pub pflags: u16,
    pub delta_time: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Along-track distance from the equator
    pub x_atc: f64,
    pub solar_elevation: f32,
    pub h_te_median: f32,
    pub h_max_canopy: f32,
    pub h_min_canopy: f32,
    pub h_mean_canopy: f32,
    /// Relief at the 98th percentile
    pub h_canopy: f32,
    /// Standard deviation of vegetation relief
    pub canopy_openness: f32,
    pub canopy_h_metrics: [f32; NUM_PERCENTILES],
}

/// Relief histogram normalized by the pair's photon count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Waveform {
    pub extent_id: u64,
    pub binsize: f32,
    pub bins: Vec<f32>,
}

impl Waveform {
    pub fn to_record(&self, registry: &RecordRegistry) -> Result<RecordObject> {
        let def = registry.get(WAVEFORM_REC_TYPE)?;
        let waveform = resolve(&def, "waveform")?;
        let size = waveform.offset + self.bins.len() * waveform.element_size();
        let mut rec = RecordObject::with_size(registry, WAVEFORM_REC_TYPE, size)?;
        rec.set_integer("extent_id", 0, self.extent_id as i64)?;
        rec.set_integer("num_bins", 0, self.bins.len() as i64)?;
        rec.set_real("binsize", 0, f64::from(self.binsize))?;
        for (b, &value) in self.bins.iter().enumerate() {
            rec.set(&waveform, b, value)?;
        }
        Ok(rec)
    }
}

fn resolve(def: &RecordDefinition, path: &str) -> Result<Field> {
    def.resolve(path).ok_or_else(|| TracklineError::invalid_field(def.name(), path))
}

struct VegetationLayout {
    array: Field,
    extent_id: Field,
    segment_id: Field,
    rgt: Field,
    cycle: Field,
    spot: Field,
    gt: Field,
    ph_count: Field,
    gnd_ph_count: Field,
    veg_ph_count: Field,
    landcover: Field,
    snowcover: Field,
    pflags: Field,
    delta_time: Field,
    latitude: Field,
    longitude: Field,
    x_atc: Field,
    solar_elevation: Field,
    h_te_median: Field,
    h_max_canopy: Field,
    h_min_canopy: Field,
    h_mean_canopy: Field,
    h_canopy: Field,
    canopy_openness: Field,
    canopy_h_metrics: Field,
}

impl VegetationLayout {
    fn new(batch: &RecordDefinition) -> Result<Self> {
        let array = resolve(batch, "vegetation")?;
        let def = array
            .subtype
            .clone()
            .ok_or_else(|| TracklineError::invalid_field(batch.name(), "vegetation"))?;
        Ok(Self {
            extent_id: resolve(&def, "extent_id")?,
            segment_id: resolve(&def, "segment_id")?,
            rgt: resolve(&def, "rgt")?,
            cycle: resolve(&def, "cycle")?,
            spot: resolve(&def, "spot")?,
            gt: resolve(&def, "gt")?,
            ph_count: resolve(&def, "ph_count")?,
            gnd_ph_count: resolve(&def, "gnd_ph_count")?,
            veg_ph_count: resolve(&def, "veg_ph_count")?,
            landcover: resolve(&def, "landcover")?,
            snowcover: resolve(&def, "snowcover")?,
            pflags: resolve(&def, "pflags")?,
            delta_time: resolve(&def, "delta_time")?,
            latitude: resolve(&def, "latitude")?,
            longitude: resolve(&def, "longitude")?,
            x_atc: resolve(&def, "x_atc")?,
            solar_elevation: resolve(&def, "solar_elevation")?,
            h_te_median: resolve(&def, "h_te_median")?,
            h_max_canopy: resolve(&def, "h_max_canopy")?,
            h_min_canopy: resolve(&def, "h_min_canopy")?,
            h_mean_canopy: resolve(&def, "h_mean_canopy")?,
            h_canopy: resolve(&def, "h_canopy")?,
            canopy_openness: resolve(&def, "canopy_openness")?,
            canopy_h_metrics: resolve(&def, "canopy_h_metrics")?,
            array,
        })
    }

    fn write(&self, rec: &mut RecordObject, i: usize, v: &Vegetation) -> Result<()> {
        let a = &self.array;
        rec.set(&a.member(i, &self.extent_id), 0, v.extent_id)?;
        rec.set(&a.member(i, &self.segment_id), 0, v.segment_id)?;
        rec.set(&a.member(i, &self.rgt), 0, v.rgt)?;
        rec.set(&a.member(i, &self.cycle), 0, v.cycle)?;
        rec.set(&a.member(i, &self.spot), 0, v.spot)?;
        rec.set(&a.member(i, &self.gt), 0, v.gt)?;
        rec.set(&a.member(i, &self.ph_count), 0, v.ph_count)?;
        rec.set(&a.member(i, &self.gnd_ph_count), 0, v.gnd_ph_count)?;
        rec.set(&a.member(i, &self.veg_ph_count), 0, v.veg_ph_count)?;
        rec.set(&a.member(i, &self.landcover), 0, v.landcover)?;
        rec.set(&a.member(i, &self.snowcover), 0, v.snowcover)?;
        rec.set(&a.member(i, &self.pflags), 0, v.pflags)?;
        rec.set(&a.member(i, &self.delta_time), 0, v.delta_time)?;
        rec.set(&a.member(i, &self.latitude), 0, v.latitude)?;
        rec.set(&a.member(i, &self.longitude), 0, v.longitude)?;
        rec.set(&a.member(i, &self.x_atc), 0, v.x_atc)?;
        rec.set(&a.member(i, &self.solar_elevation), 0, v.solar_elevation)?;
        rec.set(&a.member(i, &self.h_te_median), 0, v.h_te_median)?;
        rec.set(&a.member(i, &self.h_max_canopy), 0, v.h_max_canopy)?;
        rec.set(&a.member(i, &self.h_min_canopy), 0, v.h_min_canopy)?;
        rec.set(&a.member(i, &self.h_mean_canopy), 0, v.h_mean_canopy)?;
        rec.set(&a.member(i, &self.h_canopy), 0, v.h_canopy)?;
        rec.set(&a.member(i, &self.canopy_openness), 0, v.canopy_openness)?;
        let metrics = a.member(i, &self.canopy_h_metrics);
        for (k, &value) in v.canopy_h_metrics.iter().enumerate() {
            rec.set(&metrics, k, value)?;
        }
        Ok(())
    }

    fn read(&self, rec: &RecordObject, i: usize) -> Result<Vegetation> {
        let a = &self.array;
        let metrics = a.member(i, &self.canopy_h_metrics);
        let mut canopy_h_metrics = [0.0; NUM_PERCENTILES];
        for (k, value) in canopy_h_metrics.iter_mut().enumerate() {
            *value = rec.get(&metrics, k)?;
        }
        Ok(Vegetation {
            extent_id: rec.get(&a.member(i, &self.extent_id), 0)?,
            segment_id: rec.get(&a.member(i, &self.segment_id), 0)?,
            rgt: rec.get(&a.member(i, &self.rgt), 0)?,
            cycle: rec.get(&a.member(i, &self.cycle), 0)?,
            spot: rec.get(&a.member(i, &self.spot), 0)?,
            gt: rec.get(&a.member(i, &self.gt), 0)?,
            ph_count: rec.get(&a.member(i, &self.ph_count), 0)?,
            gnd_ph_count: rec.get(&a.member(i, &self.gnd_ph_count), 0)?,
            veg_ph_count: rec.get(&a.member(i, &self.veg_ph_count), 0)?,
            landcover: rec.get(&a.member(i, &self.landcover), 0)?,
            snowcover: rec.get(&a.member(i, &self.snowcover), 0)?,
            pflags: rec.get(&a.member(i, &self.pflags), 0)?,
            delta_time: rec.get(&a.member(i, &self.delta_time), 0)?,
            latitude: rec.get(&a.member(i, &self.latitude), 0)?,
            longitude: rec.get(&a.member(i, &self.longitude), 0)?,
            x_atc: rec.get(&a.member(i, &self.x_atc), 0)?,
            solar_elevation: rec.get(&a.member(i, &self.solar_elevation), 0)?,
            h_te_median: rec.get(&a.member(i, &self.h_te_median), 0)?,
            h_max_canopy: rec.get(&a.member(i, &self.h_max_canopy), 0)?,
            h_min_canopy: rec.get(&a.member(i, &self.h_min_canopy), 0)?,
            h_mean_canopy: rec.get(&a.member(i, &self.h_mean_canopy), 0)?,
            h_canopy: rec.get(&a.member(i, &self.h_canopy), 0)?,
            canopy_openness: rec.get(&a.member(i, &self.canopy_openness), 0)?,
            canopy_h_metrics,
        })
    }
}

impl Vegetation {
    /// Decodes every entry of an "atl08rec" batch.
    pub fn from_batch(rec: &RecordObject) -> Result<Vec<Vegetation>> {
        if !rec.is_type(ATL08_REC_TYPE) {
            return Err(TracklineError::invalid_data(
                "vegetation batch",
                format!("record type '{}' is not {ATL08_REC_TYPE}", rec.record_type()),
            ));
        }
        let layout = VegetationLayout::new(rec.definition())?;
        let stride = layout.array.element_size();
        let count = rec.allocated_size().saturating_sub(layout.array.offset) / stride.max(1);
        (0..count).map(|i| layout.read(rec, i)).collect()
    }
}

/// Identity and geolocation of pair `t`, positioned per `mode`.
pub fn geolocate(extent: &Extent, t: usize, mode: GeoLocation) -> Vegetation {
    let Some(pair) = extent.pairs.get(t) else {
        return Vegetation::default();
    };
    let orientation = Orientation::from_raw(extent.spacecraft_orientation).unwrap_or(Orientation::Transition);
    let mut v = Vegetation {
        extent_id: extent.extent_id | EXTENT_ID_ELEVATION | t as u64,
        segment_id: pair.segment_id,
        rgt: extent.reference_ground_track,
        cycle: extent.cycle,
        spot: spot_number(orientation, extent.reference_pair_track, t),
        gt: ground_track(orientation, extent.reference_pair_track, t),
        ph_count: pair.photons.len() as u32,
        solar_elevation: pair.solar_elevation,
        landcover: INVALID_FLAG,
        snowcover: INVALID_FLAG,
        x_atc: pair.segment_distance,
        ..Vegetation::default()
    };

    let ph = &pair.photons;
    let n = ph.len();
    if n == 0 {
        return v;
    }
    let (time, lat, lon, x) = match mode {
        GeoLocation::Center => {
            let mid = |f: fn(&Photon) -> f64| {
                let (lo, hi) = ph.iter().map(f).fold((f64::MAX, f64::MIN), |(lo, hi), x| (lo.min(x), hi.max(x)));
                (lo + hi) / 2.0
            };
            (mid(|p| p.delta_time), mid(|p| p.latitude), mid(|p| p.longitude), mid(|p| p.distance))
        }
        GeoLocation::Mean => {
            let mean = |f: fn(&Photon) -> f64| ph.iter().map(f).sum::<f64>() / n as f64;
            (mean(|p| p.delta_time), mean(|p| p.latitude), mean(|p| p.longitude), mean(|p| p.distance))
        }
        GeoLocation::Median => {
            let center = n / 2;
            let median = |f: fn(&Photon) -> f64| {
                if n % 2 == 1 { f(&ph[center]) } else { (f(&ph[center]) + f(&ph[center - 1])) / 2.0 }
            };
            (median(|p| p.delta_time), median(|p| p.latitude), median(|p| p.longitude), median(|p| p.distance))
        }
    };
    v.delta_time = time;
    v.latitude = lat;
    v.longitude = lon;
    v.x_atc = x + pair.segment_distance;

    let mut closest = 0;
    let mut diff_min = f64::MAX;
    for (i, p) in ph.iter().enumerate() {
        let diff = (p.delta_time - time).abs();
        if diff < diff_min {
            diff_min = diff;
            closest = i;
        }
    }
    v.landcover = ph[closest].landcover;
    v.snowcover = ph[closest].snowcover;
    v
}

/// Relief of each vegetation photon and height of each ground photon, as
/// index arrays sorted ascending.
fn classify(photons: &[Photon], use_abs_h: bool) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let relief: Vec<f64> = photons
        .iter()
        .map(|p| if use_abs_h { f64::from(p.height) } else { f64::from(p.relief) })
        .collect();
    let mut ground = Vec::new();
    let mut vegetation = Vec::new();
    for (i, p) in photons.iter().enumerate() {
        if use_abs_h || Atl08Class::is_ground(p.atl08_class) {
            ground.push(i);
        }
        if use_abs_h || Atl08Class::is_vegetation(p.atl08_class) {
            vegetation.push(i);
        }
    }
    quicksort_by(&mut ground, |&i| f64::from(photons[i].height));
    quicksort_by(&mut vegetation, |&i| relief[i]);
    (ground, vegetation, relief)
}

/// Runs PhoREAL over `photons`, filling the canopy fields of `v`, and returns
/// the normalized relief histogram.
pub fn canopy_metrics(photons: &[Photon], params: &PhorealParams, v: &mut Vegetation) -> Vec<f32> {
    let (ground, vegetation, relief) = classify(photons, params.use_abs_h);
    v.gnd_ph_count = ground.len() as u32;
    v.veg_ph_count = vegetation.len() as u32;
    let veg_cnt = vegetation.len();

    let (mut min_h, mut max_h, mut mean_h, mut std_h) = (0.0, 0.0, 0.0, 0.0);
    if veg_cnt > 0 {
        min_h = f64::MAX;
        max_h = f64::MIN;
        let mut sum = 0.0;
        for &i in &vegetation {
            sum += relief[i];
            min_h = min_h.min(relief[i]);
            max_h = max_h.max(relief[i]);
        }
        mean_h = sum / veg_cnt as f64;
        let sum_sq: f64 = vegetation.iter().map(|&i| (relief[i] - mean_h).powi(2)).sum();
        std_h = (sum_sq / veg_cnt as f64).sqrt();
    }
    v.h_min_canopy = min_h as f32;
    v.h_max_canopy = max_h as f32;
    v.h_mean_canopy = mean_h as f32;
    v.canopy_openness = std_h as f32;

    let spread_bins = ((max_h - min_h) / params.binsize).ceil();
    let num_bins = if spread_bins > MAX_BINS as f64 {
        warn!(bins = spread_bins, max = MAX_BINS, "number of bins truncated");
        v.pflags |= BIN_OVERFLOW_FLAG;
        MAX_BINS
    } else if !(spread_bins > 0.0) {
        v.pflags |= BIN_UNDERFLOW_FLAG;
        1
    } else {
        spread_bins as usize
    };

    let mut bins = vec![0u64; num_bins];
    for &i in &vegetation {
        let bin = ((relief[i] - min_h) / params.binsize).floor().max(0.0) as usize;
        bins[bin.min(num_bins - 1)] += 1;
    }

    let num_ph = photons.len().max(1) as f64;
    let waveform = bins.iter().map(|&count| (count as f64 / num_ph) as f32).collect();

    let mut cbins = bins;
    for b in 1..num_bins {
        cbins[b] += cbins[b - 1];
    }

    v.h_te_median = match ground.len() {
        0 => 0.0,
        g if g % 2 == 0 => (photons[ground[(g - 1) / 2]].height + photons[ground[(g - 1) / 2 + 1]].height) / 2.0,
        g => photons[ground[(g - 1) / 2]].height,
    };

    let percentage = |b: usize| if veg_cnt > 0 { cbins[b] as f64 / veg_cnt as f64 * 100.0 } else { 0.0 };
    let mut b = 0;
    let mut at_percentile = |threshold: f64| -> Option<f32> {
        while b < num_bins {
            if percentage(b) >= threshold && cbins[b] > 0 {
                return Some(relief[vegetation[cbins[b] as usize - 1]] as f32);
            }
            b += 1;
        }
        None
    };
    for (metric, &threshold) in v.canopy_h_metrics.iter_mut().zip(PERCENTILE_INTERVAL.iter()) {
        if let Some(value) = at_percentile(threshold) {
            *metric = value;
        }
    }
    if let Some(value) = at_percentile(CANOPY_HEIGHT_PERCENTILE) {
        v.h_canopy = value;
    }
    waveform
}

struct Batch {
    record: RecordObject,
    layout: VegetationLayout,
    len: usize,
}

/// Dispatch handler computing vegetation metrics for every extent it receives.
pub struct Atl08Dispatch {
    registry: Arc<RecordRegistry>,
    params: Icesat2Params,
    publisher: Publisher,
    batch: Mutex<Batch>,
    counters: Counters,
    active: CancellationToken,
}

impl Atl08Dispatch {
    pub fn new(
        queues: &Arc<MsgQueues>,
        registry: &Arc<RecordRegistry>,
        output: &str,
        params: Icesat2Params,
    ) -> Result<Self> {
        params.validate()?;
        let def = registry.get(ATL08_REC_TYPE)?;
        let layout = VegetationLayout::new(&def)?;
        let size = layout.array.offset + BATCH_SIZE * layout.array.element_size();
        let record = RecordObject::with_size(registry, ATL08_REC_TYPE, size)?;
        info!(output, phoreal = params.phoreal.is_some(), "vegetation metrics enabled");

        Ok(Self {
            registry: Arc::clone(registry),
            params,
            publisher: Publisher::new(queues, output),
            batch: Mutex::new(Batch { record, layout, len: 0 }),
            counters: Counters::with_names(&["h5atl03", "filtered", "posted", "dropped", "waveforms"]),
            active: CancellationToken::new(),
        })
    }

    pub fn stats(&self, clear: bool) -> StatsSnapshot {
        self.counters.snapshot(clear)
    }

    /// Stops retrying posts against a full output queue.
    pub fn cancel(&self) {
        self.active.cancel();
    }

    fn post(&self, data: &[u8]) -> std::result::Result<(), PostError> {
        loop {
            match self.publisher.post_copy(data, SYS_TIMEOUT) {
                Ok(_) => return Ok(()),
                Err(PostError::Timeout) if !self.active.is_cancelled() => {
                    warn!(queue = self.publisher.name(), "output queue full, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn post_waveform(&self, waveform: &Waveform) -> Result<()> {
        let rec = waveform.to_record(&self.registry)?;
        match self.post(&rec.serialize(SerialMode::Reference)) {
            Ok(()) => self.counters.incr("waveforms"),
            Err(e) => warn!(queue = self.publisher.name(), error = %e, "failed to post waveform"),
        }
        Ok(())
    }

    fn push(&self, vegetation: &Vegetation) -> Result<()> {
        let mut batch = self.batch.lock();
        let Batch { record, layout, len } = &mut *batch;
        layout.write(record, *len, vegetation)?;
        *len += 1;
        if *len == BATCH_SIZE {
            self.flush(&mut batch);
        }
        Ok(())
    }

    fn flush(&self, batch: &mut Batch) {
        if batch.len == 0 {
            return;
        }
        let size = batch.layout.array.offset + batch.len * batch.layout.array.element_size();
        let count = batch.len as u64;
        batch.len = 0;
        match self.post(&batch.record.serialize_with_size(SerialMode::Reference, size)) {
            Ok(()) => self.counters.add("posted", count),
            Err(e) => {
                error!(critical = true, queue = self.publisher.name(), error = %e, count, "failed to post vegetation");
                self.counters.add("dropped", count);
            }
        }
    }
}

impl DispatchHandler for Atl08Dispatch {
    fn name(&self) -> &str {
        "atl08"
    }

    fn process_record(&self, record: &RecordObject, _key: u64) -> Result<()> {
        if !record.is_type(ATL03_REC_TYPE) {
            return Err(TracklineError::invalid_data(
                "vegetation metrics",
                format!("unexpected record type '{}'", record.record_type()),
            ));
        }
        self.counters.incr("h5atl03");
        let extent = Extent::from_record(record)?;
        let mode = self.params.phoreal.as_ref().map(|p| p.geoloc).unwrap_or_default();
        for t in 0..NUM_PAIR_TRACKS {
            if extent.pairs[t].photons.is_empty() {
                self.counters.incr("filtered");
                continue;
            }
            let mut vegetation = geolocate(&extent, t, mode);
            if let Some(phoreal) = &self.params.phoreal {
                let bins = canopy_metrics(&extent.pairs[t].photons, phoreal, &mut vegetation);
                if phoreal.send_waveform {
                    let waveform = Waveform { extent_id: vegetation.extent_id, binsize: phoreal.binsize as f32, bins };
                    self.post_waveform(&waveform)?;
                }
            }
            self.push(&vegetation)?;
        }
        Ok(())
    }

    fn process_termination(&self) -> Result<()> {
        let mut batch = self.batch.lock();
        self.flush(&mut batch);
        Ok(())
    }
}
