//! ICESat-2 photon processing over a record-oriented message bus.
//!
//! Trackline subsets ATL03 granules into along-track extents, fits surface
//! elevations (ATL06-style) and computes vegetation metrics (ATL08/PhoREAL)
//! on them. Components exchange self-describing binary records over named
//! in-process queues.
//!
//! # Features
//!
//! - **Records**: runtime-defined binary layouts with typed field access,
//!   containers and CCSDS packet framing
//! - **Message queues**: named bounded FIFOs with reference-counted delivery
//! - **Dispatch**: multi-threaded routing of records to handlers
//! - **ICESat-2**: ATL03 reader, surface fitting and canopy metrics
//! - **Export**: Arrow tables, Parquet and CSV (features `arrow`, `parquet`)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use trackline::config::Icesat2Params;
//! use trackline::dispatch::{GenericFactory, KeyMode, RecordDispatcher};
//! use trackline::icesat2::atl06::Atl06Dispatch;
//! use trackline::icesat2::extent::ATL03_REC_TYPE;
//! use trackline::icesat2::reader::{Atl03Reader, ReaderOptions};
//! use trackline::fetch::MemoryFetcher;
//! use trackline::msgq::MsgQueues;
//! use trackline::record::RecordRegistry;
//!
//! fn main() -> trackline::Result<()> {
//!     let queues = Arc::new(MsgQueues::new());
//!     let registry = RecordRegistry::with_builtin_records()?;
//!     let params = Icesat2Params::from_yaml_str("cnf: high\nlen: 40.0\nres: 20.0\n")?;
//!
//!     let dispatcher =
//!         RecordDispatcher::new(&queues, &registry, "extents", KeyMode::ReceiptOrder, 4, Box::new(GenericFactory))?;
//!     let atl06 = Arc::new(Atl06Dispatch::new(&queues, &registry, "elevations", params.clone())?);
//!     dispatcher.attach(atl06, ATL03_REC_TYPE)?;
//!     dispatcher.start()?;
//!
//!     let fetcher = Arc::new(MemoryFetcher::new());
//!     let options = ReaderOptions { send_terminator: true, ..ReaderOptions::default() };
//!     let reader = Atl03Reader::new(
//!         &queues,
//!         &registry,
//!         fetcher,
//!         "ATL03_20200101000000_01230605_005_01.h5",
//!         "extents",
//!         params,
//!         options,
//!     )?;
//!     reader.join(Duration::from_secs(600));
//!     dispatcher.join(Duration::from_secs(600));
//!     Ok(())
//! }
//! ```

pub mod config;
mod error;
#[cfg(feature = "arrow")]
pub mod export;
pub mod fetch;
pub mod logging;
pub mod stats;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Record bus
pub mod dispatch;
pub mod msgq;
pub mod record;

// ICESat-2 processing
pub mod icesat2;

pub use error::*;
