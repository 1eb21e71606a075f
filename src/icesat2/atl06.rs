//! ATL06-style land ice surface fits over extents.
//!
//! Each valid pair of an extent is fitted with an iteratively reweighted
//! least-squares line: fit, rank residuals, estimate the robust spread of the
//! signal against the expected background, narrow the surface window and refit
//! until the selected photons stop changing. Results are batched into
//! "atl06rec" (or "atl06rec-compact") records.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::extent::{ATL03_REC_TYPE, Extent, Photon};
use super::{EXTENT_ID_ELEVATION, NUM_PAIR_TRACKS, Orientation, ground_track, quicksort_by, spot_number};
use crate::config::Icesat2Params;
use crate::dispatch::DispatchHandler;
use crate::msgq::{MsgQueues, PostError, Publisher, SYS_TIMEOUT};
use crate::record::{
    Field, FieldFlags, FieldType, RecordDefinition, RecordObject, RecordRegistry, SchemaBuilder, SerialMode,
};
use crate::stats::{Counters, StatsSnapshot};
use crate::{Result, TracklineError};

pub const ELEVATION_REC_TYPE: &str = "atl06rec.elevation";
pub const ATL06_REC_TYPE: &str = "atl06rec";
pub const COMPACT_ELEVATION_REC_TYPE: &str = "atl06rec-compact.elevation";
pub const ATL06_COMPACT_REC_TYPE: &str = "atl06rec-compact";

/// Elevations per posted batch record.
pub const BATCH_SIZE: usize = 256;

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;
pub const PULSE_REPETITION_FREQUENCY: f64 = 10_000.0;
/// Scales an interquartile range to a standard deviation.
pub const RDE_SCALE_FACTOR: f64 = 1.3490;
pub const SIGMA_BEAM: f64 = 4.25;
pub const SIGMA_XMIT: f64 = 0.000_000_000_68;

pub const PFLAG_SPREAD_TOO_SHORT: u16 = 0x0001;
pub const PFLAG_TOO_FEW_PHOTONS: u16 = 0x0002;
pub const PFLAG_MAX_ITERATIONS_REACHED: u16 = 0x0004;
pub const PFLAG_OUT_OF_BOUNDS: u16 = 0x0008;

pub(crate) fn define_records(registry: &RecordRegistry) -> Result<()> {
    let elevation = registry.define_with(
        SchemaBuilder::new(ELEVATION_REC_TYPE)
            .field("extent_id", FieldType::UInt64, 1)
            .field("segment_id", FieldType::UInt32, 1)
            .field("n_fit_photons", FieldType::Int32, 1)
            .field("pflags", FieldType::UInt16, 1)
            .field("rgt", FieldType::UInt16, 1)
            .field("cycle", FieldType::UInt16, 1)
            .field("spot", FieldType::UInt8, 1)
            .field("gt", FieldType::UInt8, 1)
            .field("distance", FieldType::Double, 1)
            .field("delta_time", FieldType::Double, 1)
            .flags(FieldFlags::TIME)
            .field("lat", FieldType::Double, 1)
            .flags(FieldFlags::Y_COORD)
            .field("lon", FieldType::Double, 1)
            .flags(FieldFlags::X_COORD)
            .field("h_mean", FieldType::Double, 1)
            .flags(FieldFlags::Z_COORD)
            .field("dh_fit_dx", FieldType::Double, 1)
            .field("dh_fit_dy", FieldType::Double, 1)
            .field("w_surface_window_final", FieldType::Double, 1)
            .field("rms_misfit", FieldType::Double, 1)
            .field("h_sigma", FieldType::Double, 1)
            .id_field("extent_id"),
    )?;
    registry.define_with(SchemaBuilder::new(ATL06_REC_TYPE).batch("elevation", &elevation))?;

    let compact = registry.define_with(
        SchemaBuilder::new(COMPACT_ELEVATION_REC_TYPE)
            .field("delta_time", FieldType::Double, 1)
            .flags(FieldFlags::TIME)
            .field("lat", FieldType::Double, 1)
            .flags(FieldFlags::Y_COORD)
            .field("lon", FieldType::Double, 1)
            .flags(FieldFlags::X_COORD)
            .field("h_mean", FieldType::Double, 1)
            .flags(FieldFlags::Z_COORD),
    )?;
    registry.define_with(SchemaBuilder::new(ATL06_COMPACT_REC_TYPE).batch("elevation", &compact))?;
    Ok(())
}

/// Surface fit of one pair track.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Elevation {
    pub extent_id: u64,
    /// Segment closest to the extent centre
    pub segment_id: u32,
    pub n_fit_photons: i32,
    pub pflags: u16,
    pub rgt: u16,
    pub cycle: u16,
    pub spot: u8,
    pub gt: u8,
    /// Along-track distance of the extent centre from the equator
    pub distance: f64,
    pub delta_time: f64,
    pub lat: f64,
    pub lon: f64,
    pub h_mean: f64,
    /// Along-track slope
    pub dh_fit_dx: f64,
    /// Across-track slope (not estimated from a single pair)
    pub dh_fit_dy: f64,
    pub w_surface_window_final: f64,
    pub rms_misfit: f64,
    pub h_sigma: f64,
}

fn resolve(def: &RecordDefinition, path: &str) -> Result<Field> {
    def.resolve(path).ok_or_else(|| TracklineError::invalid_field(def.name(), path))
}

fn batch_array(def: &RecordDefinition) -> Result<(Field, Arc<RecordDefinition>)> {
    let array = resolve(def, "elevation")?;
    let element = array
        .subtype
        .clone()
        .ok_or_else(|| TracklineError::invalid_field(def.name(), "elevation"))?;
    Ok((array, element))
}

struct ElevationLayout {
    array: Field,
    extent_id: Field,
    segment_id: Field,
    n_fit_photons: Field,
    pflags: Field,
    rgt: Field,
    cycle: Field,
    spot: Field,
    gt: Field,
    distance: Field,
    delta_time: Field,
    lat: Field,
    lon: Field,
    h_mean: Field,
    dh_fit_dx: Field,
    dh_fit_dy: Field,
    w_surface_window_final: Field,
    rms_misfit: Field,
    h_sigma: Field,
}

impl ElevationLayout {
    fn new(batch: &RecordDefinition) -> Result<Self> {
        let (array, def) = batch_array(batch)?;
        Ok(Self {
            extent_id: resolve(&def, "extent_id")?,
            segment_id: resolve(&def, "segment_id")?,
            n_fit_photons: resolve(&def, "n_fit_photons")?,
            pflags: resolve(&def, "pflags")?,
            rgt: resolve(&def, "rgt")?,
            cycle: resolve(&def, "cycle")?,
            spot: resolve(&def, "spot")?,
            gt: resolve(&def, "gt")?,
            distance: resolve(&def, "distance")?,
            delta_time: resolve(&def, "delta_time")?,
            lat: resolve(&def, "lat")?,
            lon: resolve(&def, "lon")?,
            h_mean: resolve(&def, "h_mean")?,
            dh_fit_dx: resolve(&def, "dh_fit_dx")?,
            dh_fit_dy: resolve(&def, "dh_fit_dy")?,
            w_surface_window_final: resolve(&def, "w_surface_window_final")?,
            rms_misfit: resolve(&def, "rms_misfit")?,
            h_sigma: resolve(&def, "h_sigma")?,
            array,
        })
    }

    fn write(&self, rec: &mut RecordObject, i: usize, e: &Elevation) -> Result<()> {
        let a = &self.array;
        rec.set(&a.member(i, &self.extent_id), 0, e.extent_id)?;
        rec.set(&a.member(i, &self.segment_id), 0, e.segment_id)?;
        rec.set(&a.member(i, &self.n_fit_photons), 0, e.n_fit_photons)?;
        rec.set(&a.member(i, &self.pflags), 0, e.pflags)?;
        rec.set(&a.member(i, &self.rgt), 0, e.rgt)?;
        rec.set(&a.member(i, &self.cycle), 0, e.cycle)?;
        rec.set(&a.member(i, &self.spot), 0, e.spot)?;
        rec.set(&a.member(i, &self.gt), 0, e.gt)?;
        rec.set(&a.member(i, &self.distance), 0, e.distance)?;
        rec.set(&a.member(i, &self.delta_time), 0, e.delta_time)?;
        rec.set(&a.member(i, &self.lat), 0, e.lat)?;
        rec.set(&a.member(i, &self.lon), 0, e.lon)?;
        rec.set(&a.member(i, &self.h_mean), 0, e.h_mean)?;
        rec.set(&a.member(i, &self.dh_fit_dx), 0, e.dh_fit_dx)?;
        rec.set(&a.member(i, &self.dh_fit_dy), 0, e.dh_fit_dy)?;
        rec.set(&a.member(i, &self.w_surface_window_final), 0, e.w_surface_window_final)?;
        rec.set(&a.member(i, &self.rms_misfit), 0, e.rms_misfit)?;
        rec.set(&a.member(i, &self.h_sigma), 0, e.h_sigma)
    }

    fn read(&self, rec: &RecordObject, i: usize) -> Result<Elevation> {
        let a = &self.array;
        Ok(Elevation {
            extent_id: rec.get(&a.member(i, &self.extent_id), 0)?,
            segment_id: rec.get(&a.member(i, &self.segment_id), 0)?,
            n_fit_photons: rec.get(&a.member(i, &self.n_fit_photons), 0)?,
            pflags: rec.get(&a.member(i, &self.pflags), 0)?,
            rgt: rec.get(&a.member(i, &self.rgt), 0)?,
            cycle: rec.get(&a.member(i, &self.cycle), 0)?,
            spot: rec.get(&a.member(i, &self.spot), 0)?,
            gt: rec.get(&a.member(i, &self.gt), 0)?,
            distance: rec.get(&a.member(i, &self.distance), 0)?,
            delta_time: rec.get(&a.member(i, &self.delta_time), 0)?,
            lat: rec.get(&a.member(i, &self.lat), 0)?,
            lon: rec.get(&a.member(i, &self.lon), 0)?,
            h_mean: rec.get(&a.member(i, &self.h_mean), 0)?,
            dh_fit_dx: rec.get(&a.member(i, &self.dh_fit_dx), 0)?,
            dh_fit_dy: rec.get(&a.member(i, &self.dh_fit_dy), 0)?,
            w_surface_window_final: rec.get(&a.member(i, &self.w_surface_window_final), 0)?,
            rms_misfit: rec.get(&a.member(i, &self.rms_misfit), 0)?,
            h_sigma: rec.get(&a.member(i, &self.h_sigma), 0)?,
        })
    }
}

struct CompactLayout {
    array: Field,
    delta_time: Field,
    lat: Field,
    lon: Field,
    h_mean: Field,
}

impl CompactLayout {
    fn new(batch: &RecordDefinition) -> Result<Self> {
        let (array, def) = batch_array(batch)?;
        Ok(Self {
            delta_time: resolve(&def, "delta_time")?,
            lat: resolve(&def, "lat")?,
            lon: resolve(&def, "lon")?,
            h_mean: resolve(&def, "h_mean")?,
            array,
        })
    }

    fn write(&self, rec: &mut RecordObject, i: usize, e: &Elevation) -> Result<()> {
        let a = &self.array;
        rec.set(&a.member(i, &self.delta_time), 0, e.delta_time)?;
        rec.set(&a.member(i, &self.lat), 0, e.lat)?;
        rec.set(&a.member(i, &self.lon), 0, e.lon)?;
        rec.set(&a.member(i, &self.h_mean), 0, e.h_mean)
    }
}

/// Number of whole elements carried by a batch record.
fn batch_len(rec: &RecordObject, array: &Field) -> usize {
    let stride = array.element_size();
    if stride == 0 {
        return 0;
    }
    rec.allocated_size().saturating_sub(array.offset) / stride
}

impl Elevation {
    /// Decodes every elevation of an "atl06rec" batch.
    pub fn from_batch(rec: &RecordObject) -> Result<Vec<Elevation>> {
        if !rec.is_type(ATL06_REC_TYPE) {
            return Err(TracklineError::invalid_data(
                "elevation batch",
                format!("record type '{}' is not {ATL06_REC_TYPE}", rec.record_type()),
            ));
        }
        let layout = ElevationLayout::new(rec.definition())?;
        (0..batch_len(rec, &layout.array)).map(|i| layout.read(rec, i)).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct Point {
    /// Index into the pair's photons
    p: usize,
    r: f64,
}

/// `(G^T G)^-1` of the design matrix `G = [1, x]`.
#[derive(Debug, Clone, Copy)]
struct Inverse {
    i11: f64,
    i12: f64,
    i22: f64,
}

impl Inverse {
    /// `None` when fewer than two distinct distances make the system singular.
    fn new(photons: &[Photon], points: &[Point]) -> Option<Self> {
        let gtg11 = points.len() as f64;
        let (mut gtg12, mut gtg22) = (0.0, 0.0);
        for pt in points {
            let x = photons[pt.p].distance;
            gtg12 += x;
            gtg22 += x * x;
        }
        let denominator = gtg11 * gtg22 - gtg12 * gtg12;
        if denominator == 0.0 || !denominator.is_finite() {
            return None;
        }
        let det = 1.0 / denominator;
        Some(Self { i11: gtg22 * det, i12: -gtg12 * det, i22: gtg11 * det })
    }

    /// Row 1 of the generalized inverse at distance `x`.
    fn gig1(&self, x: f64) -> f64 {
        self.i11 + self.i12 * x
    }

    fn gig2(&self, x: f64) -> f64 {
        self.i12 + self.i22 * x
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LineFit {
    height: f64,
    slope: f64,
    y_sigma: f64,
}

fn fit_line(photons: &[Photon], points: &[Point]) -> LineFit {
    let Some(inv) = Inverse::new(photons, points) else {
        return LineFit::default();
    };
    let mut fit = LineFit::default();
    for pt in points {
        let ph = &photons[pt.p];
        let gig1 = inv.gig1(ph.distance);
        fit.height += gig1 * f64::from(ph.height);
        fit.slope += inv.gig2(ph.distance) * f64::from(ph.height);
        fit.y_sigma += gig1 * gig1;
    }
    fit.y_sigma = fit.y_sigma.sqrt();
    fit
}

/// Latitude, longitude and time at the extent centre, fitted with the same
/// weights as the height.
fn fit_location(photons: &[Photon], points: &[Point]) -> (f64, f64, f64) {
    let Some(first) = points.first() else {
        return (0.0, 0.0, 0.0);
    };
    let Some(inv) = Inverse::new(photons, points) else {
        return (0.0, 0.0, 0.0);
    };

    // longitudes are mapped onto 0..360 when the track straddles the antimeridian
    let first_lon = photons[first.p].longitude;
    let shift_lon = !(-150.0..=150.0).contains(&first_lon);

    let (mut lat, mut lon, mut time) = (0.0, 0.0, 0.0);
    for pt in points {
        let ph = &photons[pt.p];
        let gig1 = inv.gig1(ph.distance);
        let mut ph_lon = ph.longitude;
        if shift_lon {
            ph_lon = if ph_lon < 0.0 { -ph_lon } else { 360.0 - ph_lon };
        }
        lat += gig1 * ph.latitude;
        lon += gig1 * ph_lon;
        time += gig1 * ph.delta_time;
    }
    if shift_lon {
        lon = if lon < 180.0 { -lon } else { 360.0 - lon };
    }
    (lat, lon, time)
}

/// Indices of the 25th and 75th signal percentiles among sorted residuals.
fn signal_percentiles(points: &[Point], signal: f64, zmin: f64, bg_rate: f64) -> Option<(usize, usize)> {
    let n = points.len() as i64;
    let spp = |i: i64, fraction: f64| fraction * signal + (points[i as usize].r - zmin) * bg_rate;

    let mut i0 = 0;
    while i0 < n && (i0 as f64 + 1.5) < spp(i0, 0.25) {
        i0 += 1;
    }
    let mut i1 = n - 1;
    while i1 >= 0 && (i1 as f64 - 0.5) > spp(i1, 0.75) {
        i1 -= 1;
    }
    if i1 < i0 {
        i0 = (n as f64 / 2.0 - signal / 4.0 + 0.5) as i64 - 1;
        i1 = (n as f64 / 2.0 + signal / 4.0 + 0.5) as i64;
    }
    (i0 >= 0 && i1 < n).then_some((i0 as usize, i1 as usize))
}

/// Fits pair `t` of `extent`; `None` when the pair is invalid or empty.
pub fn fit_pair(extent: &Extent, t: usize, params: &Icesat2Params) -> Option<Elevation> {
    let pair = extent.pairs.get(t)?;
    if !pair.valid || pair.photons.is_empty() {
        return None;
    }
    let photons = &pair.photons;

    let orientation = Orientation::from_raw(extent.spacecraft_orientation).unwrap_or(Orientation::Transition);
    let mut elevation = Elevation {
        extent_id: extent.extent_id | EXTENT_ID_ELEVATION | t as u64,
        segment_id: pair.segment_id,
        rgt: extent.reference_ground_track,
        cycle: extent.cycle,
        spot: spot_number(orientation, extent.reference_pair_track, t),
        gt: ground_track(orientation, extent.reference_pair_track, t),
        distance: pair.segment_distance,
        ..Elevation::default()
    };

    let velocity = f64::from(pair.spacecraft_velocity);
    let pulses = if velocity > 0.0 { pair.extent_length * PULSE_REPETITION_FREQUENCY / velocity } else { 0.0 };
    let bg_density = pulses * pair.background_rate / (SPEED_OF_LIGHT / 2.0);
    let sigma_xmit = (SPEED_OF_LIGHT / 2.0 * SIGMA_XMIT).powi(2);

    let mut points: Vec<Point> = (0..photons.len()).map(|p| Point { p, r: 0.0 }).collect();
    let mut window = 0.0;
    let mut y_sigma;
    let mut invalid = false;
    let mut iteration = 0;
    loop {
        let n = points.len();
        let fit = fit_line(photons, &points);
        elevation.h_mean = fit.height;
        elevation.dh_fit_dx = fit.slope;
        y_sigma = fit.y_sigma;

        for pt in &mut points {
            let ph = &photons[pt.p];
            pt.r = f64::from(ph.height) - (fit.height + ph.distance * fit.slope);
        }
        quicksort_by(&mut points, |pt| pt.r);

        let (zmin, zmax, bg_count) = if iteration == 0 {
            let (zmin, zmax) = (points[0].r, points[n - 1].r);
            (zmin, zmax, bg_density * (zmax - zmin))
        } else {
            (-window / 2.0, window / 2.0, bg_density * window)
        };
        let bg_rate = bg_count / (zmax - zmin);
        let signal = n as f64 - bg_count;

        let mut sigma_r = 0.0;
        if signal <= 1.0 {
            sigma_r = (zmax - zmin) / n as f64;
        } else if let Some((i0, i1)) = signal_percentiles(&points, signal, zmin, bg_rate) {
            sigma_r = (points[i1].r - points[i0].r) / RDE_SCALE_FACTOR;
        } else {
            error!(critical = true, extent_id = elevation.extent_id, n, signal, "signal percentiles out of bounds");
            elevation.pflags |= PFLAG_OUT_OF_BOUNDS;
            invalid = true;
        }

        let sigma_expected = (sigma_xmit + SIGMA_BEAM.powi(2) * fit.slope.powi(2)).sqrt();
        let sigma_r = sigma_r.min(params.maximum_robust_dispersion);
        window = params
            .minimum_window
            .max(6.0 * sigma_expected)
            .max(6.0 * sigma_r)
            .max(0.75 * window);
        let half_window = window / 2.0;

        let (mut next, mut x_min, mut x_max) = (0usize, f64::MAX, f64::MIN);
        for pt in points.iter().filter(|pt| pt.r.abs() < half_window) {
            next += 1;
            let x = photons[pt.p].distance;
            x_min = x_min.min(x);
            x_max = x_max.max(x);
        }

        if next < params.minimum_photon_count as usize {
            elevation.pflags |= PFLAG_TOO_FEW_PHOTONS;
            invalid = true;
            break;
        } else if x_max - x_min < params.along_track_spread {
            elevation.pflags |= PFLAG_SPREAD_TOO_SHORT;
            invalid = true;
            break;
        } else if next == n {
            break;
        }
        iteration += 1;
        if iteration >= params.max_iterations {
            elevation.pflags |= PFLAG_MAX_ITERATIONS_REACHED;
            break;
        }
        points.retain(|pt| pt.r.abs() < half_window);
    }

    elevation.n_fit_photons = points.len() as i32;
    elevation.w_surface_window_final = window;
    if !invalid {
        let sum_sq: f64 = points.iter().map(|pt| pt.r * pt.r).sum();
        elevation.rms_misfit = (sum_sq / points.len() as f64).sqrt();
        elevation.h_sigma = elevation.rms_misfit * y_sigma;
    }
    (elevation.lat, elevation.lon, elevation.delta_time) = fit_location(photons, &points);
    Some(elevation)
}

enum BatchLayout {
    Full(ElevationLayout),
    Compact(CompactLayout),
}

impl BatchLayout {
    fn array(&self) -> &Field {
        match self {
            BatchLayout::Full(l) => &l.array,
            BatchLayout::Compact(l) => &l.array,
        }
    }

    fn write(&self, rec: &mut RecordObject, i: usize, e: &Elevation) -> Result<()> {
        match self {
            BatchLayout::Full(l) => l.write(rec, i, e),
            BatchLayout::Compact(l) => l.write(rec, i, e),
        }
    }
}

struct Batch {
    record: RecordObject,
    layout: BatchLayout,
    len: usize,
}

/// Dispatch handler fitting surfaces to every extent it receives.
pub struct Atl06Dispatch {
    params: Icesat2Params,
    publisher: Publisher,
    batch: Mutex<Batch>,
    counters: Counters,
    active: CancellationToken,
}

impl Atl06Dispatch {
    pub fn new(
        queues: &Arc<MsgQueues>,
        registry: &Arc<RecordRegistry>,
        output: &str,
        params: Icesat2Params,
    ) -> Result<Self> {
        params.validate()?;
        let rec_type = if params.compact { ATL06_COMPACT_REC_TYPE } else { ATL06_REC_TYPE };
        let def = registry.get(rec_type)?;
        let layout = if params.compact {
            BatchLayout::Compact(CompactLayout::new(&def)?)
        } else {
            BatchLayout::Full(ElevationLayout::new(&def)?)
        };
        let size = layout.array().offset + BATCH_SIZE * layout.array().element_size();
        let record = RecordObject::with_size(registry, rec_type, size)?;
        info!(output, record_type = rec_type, "surface fits enabled");

        Ok(Self {
            params,
            publisher: Publisher::new(queues, output),
            batch: Mutex::new(Batch { record, layout, len: 0 }),
            counters: Counters::with_names(&["h5atl03", "filtered", "posted", "dropped"]),
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

    fn push(&self, elevation: &Elevation) -> Result<()> {
        let mut batch = self.batch.lock();
        let Batch { record, layout, len } = &mut *batch;
        layout.write(record, *len, elevation)?;
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
        let array = batch.layout.array();
        let size = array.offset + batch.len * array.element_size();
        let wire = batch.record.serialize_with_size(SerialMode::Reference, size);
        let count = batch.len as u64;
        batch.len = 0;
        loop {
            match self.publisher.post_copy(&wire, SYS_TIMEOUT) {
                Ok(_) => {
                    self.counters.add("posted", count);
                    return;
                }
                Err(PostError::Timeout) if !self.active.is_cancelled() => {
                    warn!(queue = self.publisher.name(), "output queue full, retrying");
                }
                Err(e) => {
                    error!(critical = true, queue = self.publisher.name(), error = %e, count, "failed to post elevations");
                    self.counters.add("dropped", count);
                    return;
                }
            }
        }
    }
}

impl DispatchHandler for Atl06Dispatch {
    fn name(&self) -> &str {
        "atl06"
    }

    fn process_record(&self, record: &RecordObject, _key: u64) -> Result<()> {
        if !record.is_type(ATL03_REC_TYPE) {
            return Err(TracklineError::invalid_data(
                "surface fit",
                format!("unexpected record type '{}'", record.record_type()),
            ));
        }
        self.counters.incr("h5atl03");
        let extent = Extent::from_record(record)?;
        for t in 0..NUM_PAIR_TRACKS {
            match fit_pair(&extent, t, &self.params) {
                Some(elevation) => {
                    if elevation.pflags != 0 {
                        debug!(extent_id = elevation.extent_id, pflags = elevation.pflags, "surface fit flagged");
                    }
                    self.push(&elevation)?;
                }
                None => self.counters.incr("filtered"),
            }
        }
        Ok(())
    }

    fn process_termination(&self) -> Result<()> {
        let mut batch = self.batch.lock();
        self.flush(&mut batch);
        Ok(())
    }
}
