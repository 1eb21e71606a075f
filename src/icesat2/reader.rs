//! ATL03 granule reader.
//!
//! One thread per reference pair track fetches the track's datasets, subsets
//! them to the requested region and walks both tracks of the pair together,
//! posting an "atl03rec" for every along-track window. When every track is
//! done the reader merges statistics, optionally posts a terminator and
//! signals completion.

use futures::future::{try_join, try_join_all};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classify::{Atl08Photons, PhotonClasses, classify_atl08};
use super::extent::{Extent, PairExtent, Photon, extent_id};
use super::region::{PolygonRegion, Projection, RasterRegion, Region};
use super::yapc::{self, YapcInput};
use super::{ATL03_SEGMENT_LENGTH, Atl08Class, INVALID_FLAG, NUM_ATL08_CLASSES, NUM_PAIR_TRACKS, NUM_TRACKS};
use crate::config::Icesat2Params;
use crate::fetch::{DatasetFetcher, FetchHandle, FetchRequest, TypedArray};
use crate::msgq::{MsgQueues, PostError, Publisher, SYS_TIMEOUT};
use crate::record::{ExceptionRecord, RecordObject, RecordRegistry, SerialMode};
use crate::stats::{Counters, StatsSnapshot};
use crate::{Result, TracklineError};

const SIDES: [&str; NUM_PAIR_TRACKS] = ["l", "r"];

/// Reader behaviour beyond the subsetting parameters.
#[derive(Clone, Default)]
pub struct ReaderOptions {
    /// Post a zero-length terminator once every track is done
    pub send_terminator: bool,
    /// Raster inclusion test; ignored when the parameters carry a polygon
    pub raster: Option<Arc<dyn RasterRegion>>,
}

/// Subsets one ATL03 granule onto an output queue.
pub struct Atl03Reader {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    registry: Arc<RecordRegistry>,
    fetcher: Arc<dyn DatasetFetcher>,
    resource: String,
    params: Icesat2Params,
    raster: Option<Arc<dyn RasterRegion>>,
    publisher: Publisher,
    send_terminator: bool,
    tracks: Vec<u8>,
    active: CancellationToken,
    completion: Mutex<bool>,
    complete: Condvar,
    counters: Counters,
}

impl Atl03Reader {
    /// Validates `params` and starts reading `resource` in the background.
    pub fn new(
        queues: &Arc<MsgQueues>,
        registry: &Arc<RecordRegistry>,
        fetcher: Arc<dyn DatasetFetcher>,
        resource: &str,
        output: &str,
        params: Icesat2Params,
        options: ReaderOptions,
    ) -> Result<Self> {
        params.validate()?;
        let tracks = match params.track {
            0 => (1..=NUM_TRACKS).collect(),
            track => vec![track],
        };

        let inner = Arc::new(Inner {
            registry: Arc::clone(registry),
            fetcher,
            resource: resource.to_string(),
            params,
            raster: options.raster,
            publisher: Publisher::new(queues, output),
            send_terminator: options.send_terminator,
            tracks,
            active: CancellationToken::new(),
            completion: Mutex::new(false),
            complete: Condvar::new(),
            counters: Counters::with_names(&[
                "segments_read",
                "extents_filtered",
                "extents_sent",
                "extents_dropped",
                "extents_retried",
            ]),
        });

        info!(resource, output, tracks = ?inner.tracks, "reading granule");
        let worker = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("atl03-reader".to_string())
            .spawn(move || worker.run())?;
        Ok(Self { inner, supervisor: Mutex::new(Some(handle)) })
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// True until every track thread has finished.
    pub fn is_active(&self) -> bool {
        !*self.inner.completion.lock()
    }

    /// Waits up to `timeout` for completion.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.completion.lock();
        while !*done {
            if self.inner.complete.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }

    /// Abandons outstanding work and waits for the track threads to exit.
    pub fn stop(&self) {
        self.inner.active.cancel();
        if let Some(handle) = self.supervisor.lock().take() {
            if handle.join().is_err() {
                error!(resource = %self.inner.resource, "reader thread panicked");
            }
        }
    }

    pub fn stats(&self, clear: bool) -> StatsSnapshot {
        self.inner.counters.snapshot(clear)
    }
}

impl Drop for Atl03Reader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Datasets of one track of a pair, restricted to its region.
struct PairData {
    region: Region,
    segment_ph_cnt: Vec<i32>,
    segment_id: Vec<i32>,
    segment_dist_x: Vec<f64>,
    segment_delta_time: Vec<f64>,
    /// Three components per segment
    velocity_sc: Vec<f64>,
    dist_ph_along: Vec<f64>,
    h_ph: Vec<f64>,
    signal_conf_ph: Vec<i8>,
    quality_ph: Vec<i8>,
    lat_ph: Vec<f64>,
    lon_ph: Vec<f64>,
    delta_time: Vec<f64>,
    bckgrd_delta_time: Vec<f64>,
    bckgrd_rate: Vec<f64>,
    /// Empty unless PhoREAL is enabled
    solar_elevation: Vec<f32>,
    classes: Option<PhotonClasses>,
    yapc: Option<Vec<u8>>,
}

struct TrackData {
    orientation: u8,
    rgt: u16,
    cycle: u16,
    pairs: [PairData; NUM_PAIR_TRACKS],
}

/// Progress of the extent walk along one track of the pair.
#[derive(Debug, Default)]
struct PairState {
    ph_in: usize,
    seg_in: usize,
    seg_ph: i32,
    start_segment: usize,
    start_distance: f64,
    seg_distance: f64,
    start_seg_portion: f64,
    track_complete: bool,
    bckgrd_in: usize,
    extent_segment: usize,
    extent_valid: bool,
    photons: Vec<Photon>,
}

impl PairState {
    fn new(pair: &PairData) -> Self {
        Self {
            start_distance: pair.segment_dist_x.first().copied().unwrap_or(0.0),
            track_complete: pair.segment_dist_x.is_empty() || pair.dist_ph_along.is_empty(),
            ..Self::default()
        }
    }
}

fn take<const N: usize>(arrays: Vec<TypedArray>) -> Result<[TypedArray; N]> {
    let len = arrays.len();
    arrays
        .try_into()
        .map_err(|_| TracklineError::invalid_data("dataset read", format!("expected {N} arrays, got {len}")))
}

fn first<T: Copy>(values: &[T], dataset: &str) -> Result<T> {
    values.first().copied().ok_or_else(|| TracklineError::DatasetFetchInvalid {
        dataset: dataset.to_string(),
        reason: "empty dataset".to_string(),
    })
}

impl Inner {
    fn run(&self) {
        std::thread::scope(|scope| {
            for &track in &self.tracks {
                let spawned = std::thread::Builder::new()
                    .name(format!("atl03-gt{track}"))
                    .spawn_scoped(scope, move || self.track_thread(track));
                if let Err(e) = spawned {
                    error!(resource = %self.resource, track, error = %e, "failed to start track thread");
                }
            }
        });
        self.finish();
    }

    fn track_thread(&self, track: u8) {
        let mut stats = StatsSnapshot::default();
        match self.subset_track(track, &mut stats) {
            Ok(()) => debug!(resource = %self.resource, track, "track complete"),
            Err(TracklineError::EmptySpatialSubset { .. }) => {
                info!(resource = %self.resource, track, "no photons inside region");
            }
            Err(e) => {
                error!(resource = %self.resource, track, error = %e, "failure during processing of track");
                self.post_exception(&e);
            }
        }
        let _done = self.completion.lock();
        self.counters.merge(&stats);
    }

    fn finish(&self) {
        let mut done = self.completion.lock();
        if self.send_terminator {
            let mut retries = 0;
            if let Err(e) = self.post(&[], &mut retries) {
                warn!(queue = self.publisher.name(), error = %e, "failed to post terminator");
            }
        }
        info!(resource = %self.resource, "completed processing resource");
        *done = true;
        self.complete.notify_all();
    }

    fn subset_track(&self, track: u8, stats: &mut StatsSnapshot) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        let data = runtime.block_on(self.read_track(track, stats))?;
        self.assemble(track, &data, stats)
    }

    async fn fetch(&self, requests: Vec<FetchRequest>) -> Result<Vec<TypedArray>> {
        let timeout = Duration::from_millis(self.params.read_timeout_ms);
        try_join_all(
            requests.into_iter().map(|request| FetchHandle::issue(&self.fetcher, request).join(timeout)),
        )
        .await
    }

    async fn read_track(&self, track: u8, stats: &mut StatsSnapshot) -> Result<TrackData> {
        let r = self.resource.as_str();
        let [orient, rgt, cycle] = take(
            self.fetch(vec![
                FetchRequest::all(r, "/orbit_info/sc_orient"),
                FetchRequest::all(r, "/ancillary_data/start_rgt"),
                FetchRequest::all(r, "/ancillary_data/start_cycle"),
            ])
            .await?,
        )?;

        let [left_beam, right_beam] = SIDES.map(|side| format!("gt{track}{side}"));
        let (left_region, projection) = self.read_region(&left_beam, None, stats).await?;
        let (right_region, _) = self.read_region(&right_beam, Some(projection), stats).await?;
        let (left, right) = try_join(
            self.read_pair(&left_beam, left_region),
            self.read_pair(&right_beam, right_region),
        )
        .await?;

        Ok(TrackData {
            orientation: first(&orient.into_u8(), "/orbit_info/sc_orient")?,
            rgt: first(&rgt.into_i64(), "/ancillary_data/start_rgt")? as u16,
            cycle: first(&cycle.into_i64(), "/ancillary_data/start_cycle")? as u16,
            pairs: [left, right],
        })
    }

    /// Region of one beam; the projection comes from the pair's first track.
    /// Locates the segments of `beam` inside the region; every scanned segment counts as read.
    async fn read_region(
        &self,
        beam: &str,
        projection: Option<Projection>,
        stats: &mut StatsSnapshot,
    ) -> Result<(Region, Projection)> {
        let r = self.resource.as_str();
        let geo = |name: &str| FetchRequest::all(r, format!("{beam}/geolocation/{name}"));
        let [lat, lon, cnt] = take(
            self.fetch(vec![geo("reference_photon_lat"), geo("reference_photon_lon"), geo("segment_ph_cnt")])
                .await?,
        )?;
        let (lat, lon, cnt) = (lat.into_f64(), lon.into_f64(), cnt.into_i32());
        if lat.len() != cnt.len() || lon.len() != cnt.len() {
            return Err(TracklineError::invalid_data(
                format!("{r}/{beam}"),
                format!("{} latitudes and {} longitudes for {} segments", lat.len(), lon.len(), cnt.len()),
            ));
        }
        stats.add("segments_read", cnt.len() as u64);

        let projection =
            projection.unwrap_or_else(|| Projection::for_latitude(lat.first().copied().unwrap_or(0.0)));
        let region = if !self.params.polygon.is_empty() {
            let polygon = PolygonRegion::new(&self.params.polygon, projection);
            Region::polygon(&lat, &lon, &cnt, &polygon, r)?
        } else if let Some(raster) = &self.raster {
            Region::raster(&lat, &lon, &cnt, raster.as_ref(), r)?
        } else {
            Region::full(&cnt, r)?
        };
        Ok((region, projection))
    }

    fn atl08_resource(&self) -> Result<String> {
        let mut name = self.resource.clone();
        if name.get(4..5).is_none() {
            return Err(TracklineError::config(format!("cannot derive ATL08 granule from '{name}'")));
        }
        name.replace_range(4..5, "8");
        Ok(name)
    }

    async fn read_pair(&self, beam: &str, region: Region) -> Result<PairData> {
        let r = self.resource.as_str();
        let segments = |name: &str| {
            FetchRequest::all(r, format!("{beam}/geolocation/{name}")).rows(region.first_segment, region.num_segments)
        };
        let photons = |name: &str| {
            FetchRequest::all(r, format!("{beam}/heights/{name}")).rows(region.first_photon, region.num_photons)
        };
        let phoreal = self.params.phoreal.is_some();

        let mut requests = vec![
            segments("segment_ph_cnt"),
            segments("segment_id"),
            segments("segment_dist_x"),
            segments("delta_time"),
            segments("velocity_sc"),
            photons("dist_ph_along"),
            photons("h_ph"),
            photons("signal_conf_ph").column(self.params.surface_type.column()),
            photons("quality_ph"),
            photons("lat_ph"),
            photons("lon_ph"),
            photons("delta_time"),
            FetchRequest::all(r, format!("{beam}/bckgrd_atlas/delta_time")),
            FetchRequest::all(r, format!("{beam}/bckgrd_atlas/bckgrd_rate")),
        ];
        if phoreal {
            requests.push(segments("solar_elevation"));
        }
        let atl08 = if self.params.atl08_enabled() {
            let resource = self.atl08_resource()?;
            let sp = |name: &str| FetchRequest::all(&resource, format!("{beam}/signal_photons/{name}"));
            vec![sp("ph_segment_id"), sp("classed_pc_indx"), sp("classed_pc_flag"), sp("ph_h")]
        } else {
            Vec::new()
        };

        let (arrays, atl08) = try_join(self.fetch(requests), self.fetch(atl08)).await?;
        let mut arrays = arrays.into_iter();
        let mut next = move || {
            arrays.next().ok_or_else(|| TracklineError::invalid_data(beam.to_string(), "missing dataset read"))
        };

        let mut pair = PairData {
            region,
            segment_ph_cnt: next()?.into_i32(),
            segment_id: next()?.into_i32(),
            segment_dist_x: next()?.into_f64(),
            segment_delta_time: next()?.into_f64(),
            velocity_sc: next()?.into_f64(),
            dist_ph_along: next()?.into_f64(),
            h_ph: next()?.into_f64(),
            signal_conf_ph: next()?.into_i8(),
            quality_ph: next()?.into_i8(),
            lat_ph: next()?.into_f64(),
            lon_ph: next()?.into_f64(),
            delta_time: next()?.into_f64(),
            bckgrd_delta_time: next()?.into_f64(),
            bckgrd_rate: next()?.into_f64(),
            solar_elevation: if phoreal { next()?.into_f32() } else { Vec::new() },
            classes: None,
            yapc: None,
        };

        if let Ok([segment_id, indx, flag, ph_h]) = <[TypedArray; 4]>::try_from(atl08) {
            let (segment_id, indx, flag, ph_h) =
                (segment_id.into_i32(), indx.into_i32(), flag.into_u8(), ph_h.into_f32());
            let table = Atl08Photons {
                segment_id: &segment_id,
                classed_pc_indx: &indx,
                classed_pc_flag: &flag,
                ph_h: &ph_h,
            };
            pair.classes =
                Some(classify_atl08(&pair.segment_id, &pair.segment_ph_cnt, pair.dist_ph_along.len(), &table));
        }

        if let Some(params) = &self.params.yapc {
            let input = YapcInput {
                segment_ph_cnt: &pair.segment_ph_cnt,
                segment_dist_x: &pair.segment_dist_x,
                dist_ph_along: &pair.dist_ph_along,
                h_ph: &pair.h_ph,
            };
            pair.yapc = Some(yapc::score(params, self.params.minimum_photon_count, &input)?);
        }

        let num_photons = pair.dist_ph_along.len();
        let lengths = [
            pair.h_ph.len(),
            pair.signal_conf_ph.len(),
            pair.quality_ph.len(),
            pair.lat_ph.len(),
            pair.lon_ph.len(),
            pair.delta_time.len(),
        ];
        if lengths.iter().any(|&n| n != num_photons) {
            return Err(TracklineError::invalid_data(
                format!("{r}/{beam}"),
                format!("photon datasets disagree in length: {num_photons} vs {lengths:?}"),
            ));
        }
        Ok(pair)
    }

    /// Walks both tracks of the pair window by window.
    fn assemble(&self, track: u8, data: &TrackData, stats: &mut StatsSnapshot) -> Result<()> {
        let params = &self.params;
        let extent_length = match params.dist_in_seg {
            true => params.extent_length * ATL03_SEGMENT_LENGTH,
            false => params.extent_length,
        };
        let mut state = [PairState::new(&data.pairs[0]), PairState::new(&data.pairs[1])];
        let mut counter: u32 = 0;

        while !self.active.is_cancelled() && state.iter().any(|s| !s.track_complete) {
            for (pair, s) in data.pairs.iter().zip(state.iter_mut()) {
                self.select_photons(pair, s, extent_length)?;
            }

            if state.iter().any(|s| s.extent_valid) || params.pass_invalid {
                let extent = self.build_extent(track, counter, data, &mut state, extent_length);
                let record = extent.to_record(&self.registry)?;
                self.post_extent(&record, stats);
            } else {
                stats.add("extents_filtered", 1);
            }
            counter = counter.wrapping_add(1);
        }
        Ok(())
    }

    /// Collects the next window's photons and advances to the following window.
    fn select_photons(&self, pair: &PairData, s: &mut PairState, extent_length: f64) -> Result<()> {
        s.photons.clear();
        if s.track_complete {
            s.extent_valid = false;
            return Ok(());
        }

        let params = &self.params;
        let counts = &pair.segment_ph_cnt;
        let seg_x = &pair.segment_dist_x;
        let ph_x = &pair.dist_ph_along;

        let mut ph = s.ph_in;
        let mut seg = s.seg_in;
        let mut count = s.seg_ph;
        let mut extent_complete = false;
        let mut step_complete = false;

        s.extent_segment = s.seg_in;
        s.extent_valid = true;
        s.start_seg_portion = ph_x[ph] / ATL03_SEGMENT_LENGTH;

        while !extent_complete || !step_complete {
            count += 1;
            while seg < counts.len() && count > counts[seg] {
                count = 1;
                seg += 1;
            }
            if seg >= seg_x.len() {
                error!(resource = %self.resource, segment = seg, segments = seg_x.len(), "photons with no segments detected");
                s.track_complete = true;
                break;
            }

            let along_track = seg_x[seg] - s.start_distance + ph_x[ph];
            let along_segments = (seg - s.extent_segment) as f64;

            let stepped = match params.dist_in_seg {
                true => along_segments >= params.extent_step,
                false => along_track >= params.extent_step,
            };
            if !step_complete && stepped {
                s.ph_in = ph;
                s.seg_in = seg;
                s.seg_ph = count - 1;
                step_complete = true;
            }

            let within = match params.dist_in_seg {
                true => along_segments < params.extent_length,
                false => along_track < params.extent_length,
            };
            if within {
                if let Some(photon) = self.select(pair, ph, seg, along_track - extent_length / 2.0)? {
                    s.photons.push(photon);
                }
            } else {
                extent_complete = true;
            }

            ph += 1;
            if ph >= ph_x.len() {
                s.track_complete = true;
                break;
            }
        }

        s.seg_distance = s.start_distance + extent_length / 2.0;
        if params.dist_in_seg {
            if let Some(&distance) = seg_x.get(s.extent_segment + params.extent_step as usize) {
                s.start_distance = distance;
            }
        } else {
            s.start_distance += params.extent_step;
            while s.start_segment + 1 < seg_x.len() && s.start_distance >= seg_x[s.start_segment + 1] {
                s.start_distance += seg_x[s.start_segment + 1] - seg_x[s.start_segment] - ATL03_SEGMENT_LENGTH;
                s.start_segment += 1;
            }
        }

        if s.photons.len() < params.minimum_photon_count as usize {
            s.extent_valid = false;
        }
        if let [first, .., last] = s.photons.as_slice() {
            if last.distance - first.distance < params.along_track_spread {
                s.extent_valid = false;
            }
        }
        Ok(())
    }

    /// Applies the photon filters; `None` when the photon is excluded.
    fn select(&self, pair: &PairData, ph: usize, seg: usize, distance: f64) -> Result<Option<Photon>> {
        let params = &self.params;
        let invalid = |what: String| TracklineError::invalid_data(self.resource.clone(), what);

        let atl03_cnf = pair.signal_conf_ph[ph];
        match params.atl03_cnf.allows(atl03_cnf) {
            None => return Err(invalid(format!("invalid atl03 signal confidence: {atl03_cnf}"))),
            Some(false) => return Ok(None),
            Some(true) => {}
        }

        let quality_ph = pair.quality_ph[ph];
        match params.quality_ph.allows(quality_ph) {
            None => return Err(invalid(format!("invalid atl03 photon quality: {quality_ph}"))),
            Some(false) => return Ok(None),
            Some(true) => {}
        }

        let (atl08_class, relief) = match (&pair.classes, params.atl08_mask()) {
            (Some(classes), Some(mask)) => {
                let class = classes.class[ph];
                match mask.allows(class) {
                    None => {
                        return Err(invalid(format!(
                            "invalid atl08 classification: {class} (of {NUM_ATL08_CLASSES})"
                        )));
                    }
                    Some(false) => return Ok(None),
                    Some(true) => (class, classes.relief[ph]),
                }
            }
            _ => (Atl08Class::Unclassified as u8, 0.0),
        };

        let yapc_score = match (&pair.yapc, &params.yapc) {
            (Some(scores), Some(yapc)) => {
                let score = scores[ph];
                if score < yapc.score {
                    return Ok(None);
                }
                score
            }
            _ => 0,
        };

        if !pair.region.includes_segment(seg) {
            return Ok(None);
        }

        Ok(Some(Photon {
            delta_time: pair.delta_time[ph],
            latitude: pair.lat_ph[ph],
            longitude: pair.lon_ph[ph],
            distance,
            height: pair.h_ph[ph] as f32,
            relief,
            atl08_class,
            atl03_cnf,
            quality_ph,
            yapc_score,
            landcover: INVALID_FLAG,
            snowcover: INVALID_FLAG,
        }))
    }

    fn build_extent(
        &self,
        track: u8,
        counter: u32,
        data: &TrackData,
        state: &mut [PairState; NUM_PAIR_TRACKS],
        extent_length: f64,
    ) -> Extent {
        let params = &self.params;
        let mut extent = Extent {
            reference_pair_track: track,
            spacecraft_orientation: data.orientation,
            reference_ground_track: data.rgt,
            cycle: data.cycle,
            extent_id: extent_id(data.rgt, data.cycle, track, counter),
            ..Extent::default()
        };

        for (t, (pair, s)) in data.pairs.iter().zip(state.iter_mut()).enumerate() {
            let first = s.extent_segment;
            let velocity = pair
                .velocity_sc
                .get(first * 3..first * 3 + 3)
                .map_or(0.0, |v| v.iter().map(|c| c * c).sum::<f64>().sqrt());

            // closest ATL06 segment to the extent centre
            let mut segment_id = pair.segment_id.get(first).copied().map_or(0.0, f64::from);
            if params.dist_in_seg {
                segment_id += (params.extent_length / 2.0).trunc();
            } else {
                segment_id += s.start_seg_portion;
                segment_id += (params.extent_length / ATL03_SEGMENT_LENGTH / 2.0).trunc();
            }

            extent.pairs[t] = PairExtent {
                valid: s.extent_valid,
                segment_id: (segment_id + 0.5) as u32,
                segment_distance: s.seg_distance,
                extent_length,
                spacecraft_velocity: velocity as f32,
                background_rate: background_rate(pair, s),
                solar_elevation: pair.solar_elevation.get(first).copied().unwrap_or(0.0),
                photons: std::mem::take(&mut s.photons),
            };
        }
        extent
    }

    /// Posts `data`, retrying on timeout while the reader is active.
    fn post(&self, data: &[u8], retries: &mut u64) -> std::result::Result<(), PostError> {
        loop {
            match self.publisher.post_copy(data, SYS_TIMEOUT) {
                Ok(_) => return Ok(()),
                Err(PostError::Timeout) if !self.active.is_cancelled() => *retries += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn post_extent(&self, record: &RecordObject, stats: &mut StatsSnapshot) {
        let mut retries = 0;
        let result = self.post(&record.serialize(SerialMode::Reference), &mut retries);
        stats.add("extents_retried", retries);
        match result {
            Ok(()) => stats.add("extents_sent", 1),
            Err(e) => {
                error!(queue = self.publisher.name(), record_type = record.record_type(), error = %e, "failed to post record");
                stats.add("extents_dropped", 1);
            }
        }
    }

    fn post_exception(&self, err: &TracklineError) {
        let exception = ExceptionRecord {
            text: format!("{err}: ({})", self.resource),
            ..ExceptionRecord::from_error(err)
        };
        let posted = exception.to_record(&self.registry).and_then(|record| {
            let mut retries = 0;
            self.post(&record.serialize(SerialMode::Reference), &mut retries)
                .map_err(|e| e.into_error(self.publisher.name()))
        });
        if let Err(e) = posted {
            warn!(queue = self.publisher.name(), error = %e, "failed to post exception record");
        }
    }
}

/// Background rate interpolated at the extent's first segment time.
fn background_rate(pair: &PairData, state: &mut PairState) -> f64 {
    let times = &pair.bckgrd_delta_time;
    let rates = &pair.bckgrd_rate;
    let Some(&last) = rates.last() else {
        return 0.0;
    };
    let Some(&segment_time) = pair.segment_delta_time.get(state.extent_segment) else {
        return last;
    };

    let n = times.len().min(rates.len());
    while state.bckgrd_in < n {
        let i = state.bckgrd_in;
        if times[i] >= segment_time {
            if i == 0 {
                return rates[0];
            }
            let run = times[i] - times[i - 1];
            let rise = rates[i] - rates[i - 1];
            return rise / run * (segment_time - times[i - 1]) + rates[i - 1];
        }
        state.bckgrd_in += 1;
    }
    last
}
