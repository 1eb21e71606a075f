//! Synthetic granule read end to end: reader, dispatcher and surface fits.
#![cfg(feature = "benchmark")]

use std::sync::Arc;
use std::time::Duration;

use trackline::config::{Coord, Icesat2Params};
use trackline::dispatch::{GenericFactory, KeyMode, RecordDispatcher};
use trackline::icesat2::atl06::{Atl06Dispatch, Elevation};
use trackline::icesat2::extent::ATL03_REC_TYPE;
use trackline::icesat2::reader::{Atl03Reader, ReaderOptions};
use trackline::msgq::{MsgQueues, Subscriber, SubscriberKind, Timeout};
use trackline::record::{RecordObject, RecordRegistry};
use trackline::test_utils::SyntheticGranule;

fn sloped(x: f64) -> f64 {
    200.0 + 0.02 * x
}

fn run(granule: &SyntheticGranule, params: Icesat2Params) -> (Vec<Elevation>, Atl03Reader) {
    let queues = Arc::new(MsgQueues::new());
    let registry = RecordRegistry::with_builtin_records().unwrap();
    let mut out = Subscriber::new(&queues, "elevations", SubscriberKind::Confidence);

    let dispatcher =
        RecordDispatcher::new(&queues, &registry, "extents", KeyMode::ReceiptOrder, 4, Box::new(GenericFactory))
            .unwrap();
    let atl06 = Arc::new(Atl06Dispatch::new(&queues, &registry, "elevations", params.clone()).unwrap());
    dispatcher.attach(atl06, ATL03_REC_TYPE).unwrap();
    dispatcher.start().unwrap();

    let reader = Atl03Reader::new(
        &queues,
        &registry,
        granule.fetcher(),
        &granule.resource,
        "extents",
        params,
        ReaderOptions { send_terminator: true, ..ReaderOptions::default() },
    )
    .unwrap();
    assert!(reader.join(Duration::from_secs(30)));
    assert!(dispatcher.join(Duration::from_secs(30)));

    let mut elevations = Vec::new();
    while let Ok(msg) = out.receive_ref(Timeout::After(Duration::from_millis(200))) {
        let rec = RecordObject::deserialize(&registry, &msg).unwrap();
        elevations.extend(Elevation::from_batch(&rec).unwrap());
    }
    (elevations, reader)
}

#[test]
fn granule_to_surface_fits() {
    let granule = SyntheticGranule { surface: sloped, ..SyntheticGranule::default() };
    let (elevations, reader) = run(&granule, Icesat2Params { track: 1, ..Icesat2Params::default() });

    let stats = reader.stats(false);
    assert_eq!(stats.get("extents_sent"), 9);
    assert_eq!(elevations.len(), 18);
    for e in &elevations {
        assert!((e.dh_fit_dx - 0.02).abs() < 1e-3, "slope {}", e.dh_fit_dx);
    }
}

#[test]
fn polygon_outside_the_granule_yields_nothing() {
    let granule = SyntheticGranule::default();
    let polygon = vec![
        Coord { lat: -10.0, lon: 100.0 },
        Coord { lat: -10.0, lon: 101.0 },
        Coord { lat: -11.0, lon: 101.0 },
    ];
    let (elevations, reader) = run(&granule, Icesat2Params { polygon, ..Icesat2Params::default() });

    let stats = reader.stats(false);
    assert!(elevations.is_empty());
    assert!(stats.get("segments_read") > 0);
    assert_eq!(stats.get("extents_sent"), 0);
}
