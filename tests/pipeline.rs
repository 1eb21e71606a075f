//! End-to-end runs of extents through a dispatcher into the fit handlers.

use anyhow::{Context, Result, ensure};
use std::sync::Arc;
use std::time::Duration;

use trackline::config::{Icesat2Params, PhorealParams};
use trackline::dispatch::{DispatchHandler, GenericFactory, KeyMode, RecordDispatcher};
use trackline::icesat2::atl06::{Atl06Dispatch, Elevation};
use trackline::icesat2::atl08::{ATL08_REC_TYPE, Atl08Dispatch, Vegetation};
use trackline::icesat2::extent::{ATL03_REC_TYPE, Extent, PairExtent, Photon, extent_id};
use trackline::icesat2::{Atl08Class, EXTENT_ID_ELEVATION};
use trackline::msgq::{MsgQueues, Publisher, Subscriber, SubscriberKind, Timeout};
use trackline::record::{RecordObject, RecordRegistry, SerialMode};

const EXTENTS: u32 = 300;

/// Flat ground at `height` with a canopy layer 0..10 m above it.
fn pair(height: f64) -> PairExtent {
    let photons = (0..40)
        .map(|i| {
            let x = i as f64 - 19.5;
            let ground = i % 2 == 0;
            let relief = if ground { 0.0 } else { (i % 20) as f32 * 0.5 };
            Photon {
                delta_time: 500.0 + x / 7000.0,
                latitude: 45.0 + x * 1.0e-5,
                longitude: 7.0,
                distance: x,
                height: height as f32 + relief,
                relief,
                atl08_class: (if ground { Atl08Class::Ground } else { Atl08Class::Canopy }) as u8,
                ..Photon::default()
            }
        })
        .collect();
    PairExtent {
        valid: true,
        segment_id: 900_000,
        segment_distance: 2.0e6,
        extent_length: 40.0,
        spacecraft_velocity: 7000.0,
        background_rate: 1.0e5,
        solar_elevation: 30.0,
        photons,
    }
}

fn extent(counter: u32) -> Extent {
    Extent {
        reference_pair_track: 3,
        spacecraft_orientation: 0,
        reference_ground_track: 42,
        cycle: 12,
        extent_id: extent_id(42, 12, 3, counter),
        pairs: [pair(1000.0), pair(1010.0)],
    }
}

fn drain<T>(
    sub: &mut Subscriber,
    registry: &RecordRegistry,
    decode: fn(&RecordObject) -> trackline::Result<Vec<T>>,
) -> Vec<T> {
    let mut results = Vec::new();
    while let Ok(msg) = sub.receive_ref(Timeout::After(Duration::from_millis(200))) {
        if msg.is_terminator() {
            break;
        }
        let rec = RecordObject::deserialize(registry, &msg).unwrap();
        results.extend(decode(&rec).unwrap());
    }
    results
}

#[test]
fn extents_flow_through_both_handlers() {
    for threads in [1, 2, 8] {
        let queues = Arc::new(MsgQueues::new());
        let registry = RecordRegistry::with_builtin_records().unwrap();
        let mut elevations = Subscriber::new(&queues, "elevations", SubscriberKind::Confidence);
        let mut vegetation = Subscriber::new(&queues, "vegetation", SubscriberKind::Confidence);

        let params = Icesat2Params { phoreal: Some(PhorealParams::default()), ..Icesat2Params::default() };
        let dispatcher = RecordDispatcher::new(
            &queues,
            &registry,
            "extents",
            KeyMode::ReceiptOrder,
            threads,
            Box::new(GenericFactory),
        )
        .unwrap();
        let atl06 = Arc::new(Atl06Dispatch::new(&queues, &registry, "elevations", params.clone()).unwrap());
        let atl08 = Arc::new(Atl08Dispatch::new(&queues, &registry, "vegetation", params).unwrap());
        dispatcher.attach(atl06.clone(), ATL03_REC_TYPE).unwrap();
        dispatcher.attach(atl08.clone(), ATL03_REC_TYPE).unwrap();
        dispatcher.start().unwrap();

        let publisher = Publisher::new(&queues, "extents");
        for counter in 0..EXTENTS {
            let rec = extent(counter).to_record(&registry).unwrap();
            publisher.post_copy(&rec.serialize(SerialMode::Reference), Timeout::Forever).unwrap();
        }
        publisher.post_terminator(Timeout::Forever).unwrap();
        assert!(dispatcher.join(Duration::from_secs(30)), "threads={threads}");

        let elevations = drain(&mut elevations, &registry, Elevation::from_batch);
        assert_eq!(elevations.len(), 2 * EXTENTS as usize, "threads={threads}");
        for e in &elevations {
            let expected = if e.extent_id & 1 == 0 { 1000.0 } else { 1010.0 };
            assert_eq!(e.extent_id & EXTENT_ID_ELEVATION, EXTENT_ID_ELEVATION);
            assert_eq!((e.rgt, e.cycle), (42, 12));
            assert!((e.h_mean - expected).abs() < 10.0, "h_mean {}", e.h_mean);
        }
        let mut ids: Vec<u64> = elevations.iter().map(|e| e.extent_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 2 * EXTENTS as usize);

        let canopy = drain(&mut vegetation, &registry, Vegetation::from_batch);
        assert_eq!(canopy.len(), 2 * EXTENTS as usize);
        for v in &canopy {
            assert_eq!((v.gnd_ph_count, v.veg_ph_count), (20, 20));
            assert_eq!(v.h_max_canopy, 9.5);
            assert_eq!(v.pflags, 0);
        }

        let stats = atl06.stats(false);
        assert_eq!(stats.get("h5atl03"), u64::from(EXTENTS));
        assert_eq!(stats.get("posted") + stats.get("filtered"), 2 * u64::from(EXTENTS));
        assert_eq!(atl08.stats(false).get("posted"), 2 * u64::from(EXTENTS));
    }
}

#[test]
fn batches_hold_at_most_256_results() -> Result<()> {
    let queues = Arc::new(MsgQueues::new());
    let registry = RecordRegistry::with_builtin_records()?;
    let mut sub = Subscriber::new(&queues, "vegetation", SubscriberKind::Confidence);
    let handler = Atl08Dispatch::new(&queues, &registry, "vegetation", Icesat2Params::default())?;

    for counter in 0..200 {
        let rec = extent(counter).to_record(&registry)?;
        handler
            .process_record(&rec, u64::from(counter))
            .with_context(|| format!("extent {counter}"))?;
    }
    handler.process_termination()?;

    let mut sizes = Vec::new();
    while let Ok(msg) = sub.receive_ref(Timeout::After(Duration::from_millis(200))) {
        let rec = RecordObject::deserialize(&registry, &msg).context("decoding batch")?;
        ensure!(rec.is_type(ATL08_REC_TYPE), "unexpected record type {}", rec.record_type());
        sizes.push(Vegetation::from_batch(&rec)?.len());
    }
    ensure!(sizes == [256, 144], "batch sizes {sizes:?}");
    Ok(())
}
