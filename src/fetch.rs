//! Async dataset-fetch boundary.
//!
//! Granule readers ask a [`DatasetFetcher`] for whole or partial datasets and
//! join the outstanding reads with a timeout through [`FetchHandle`]. The
//! HDF5 backend lives outside this crate; [`MemoryFetcher`] serves datasets
//! held in memory.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{Result, TracklineError};

/// Rows to read from a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub resource: String,
    pub dataset: String,
    /// Single column of a 2-D dataset; `None` reads every column row-major
    pub column: Option<usize>,
    pub start_row: usize,
    /// `None` reads to the end of the dataset
    pub num_rows: Option<usize>,
}

impl FetchRequest {
    /// Every row and column of `dataset`.
    pub fn all(resource: &str, dataset: impl Into<String>) -> Self {
        Self {
            resource: resource.to_string(),
            dataset: dataset.into(),
            column: None,
            start_row: 0,
            num_rows: None,
        }
    }

    pub fn column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }

    pub fn rows(mut self, start_row: usize, num_rows: usize) -> Self {
        self.start_row = start_row;
        self.num_rows = Some(num_rows);
        self
    }
}

/// Dataset values in their stored element type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! convert_into {
    ($name:ident, $t:ty) => {
        /// Converts every element with `as` semantics.
        pub fn $name(self) -> Vec<$t> {
            match self {
                TypedArray::I8(v) => v.into_iter().map(|x| x as $t).collect(),
                TypedArray::U8(v) => v.into_iter().map(|x| x as $t).collect(),
                TypedArray::I32(v) => v.into_iter().map(|x| x as $t).collect(),
                TypedArray::I64(v) => v.into_iter().map(|x| x as $t).collect(),
                TypedArray::F32(v) => v.into_iter().map(|x| x as $t).collect(),
                TypedArray::F64(v) => v.into_iter().map(|x| x as $t).collect(),
            }
        }
    };
}

impl TypedArray {
    pub fn len(&self) -> usize {
        match self {
            TypedArray::I8(v) => v.len(),
            TypedArray::U8(v) => v.len(),
            TypedArray::I32(v) => v.len(),
            TypedArray::I64(v) => v.len(),
            TypedArray::F32(v) => v.len(),
            TypedArray::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per element.
    pub fn element_size(&self) -> usize {
        match self {
            TypedArray::I8(_) | TypedArray::U8(_) => 1,
            TypedArray::I32(_) | TypedArray::F32(_) => 4,
            TypedArray::I64(_) | TypedArray::F64(_) => 8,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TypedArray::I8(_) => "int8",
            TypedArray::U8(_) => "uint8",
            TypedArray::I32(_) => "int32",
            TypedArray::I64(_) => "int64",
            TypedArray::F32(_) => "float",
            TypedArray::F64(_) => "double",
        }
    }

    convert_into!(into_f64, f64);
    convert_into!(into_f32, f32);
    convert_into!(into_i64, i64);
    convert_into!(into_i32, i32);
    convert_into!(into_i8, i8);
    convert_into!(into_u8, u8);

    fn gather(&self, indices: impl Iterator<Item = usize>) -> TypedArray {
        match self {
            TypedArray::I8(v) => TypedArray::I8(indices.map(|i| v[i]).collect()),
            TypedArray::U8(v) => TypedArray::U8(indices.map(|i| v[i]).collect()),
            TypedArray::I32(v) => TypedArray::I32(indices.map(|i| v[i]).collect()),
            TypedArray::I64(v) => TypedArray::I64(indices.map(|i| v[i]).collect()),
            TypedArray::F32(v) => TypedArray::F32(indices.map(|i| v[i]).collect()),
            TypedArray::F64(v) => TypedArray::F64(indices.map(|i| v[i]).collect()),
        }
    }
}

/// Source of granule datasets.
#[async_trait::async_trait]
pub trait DatasetFetcher: Send + Sync + 'static {
    /// Read the rows described by `request`
    ///
    /// Returns:
    /// - `Ok(array)` - Values in the dataset's stored type
    /// - `Err(DatasetFetchInvalid)` - Missing resource or dataset, or rows out of range
    /// - `Err(e)` - Backend failure
    async fn read(&self, request: FetchRequest) -> Result<TypedArray>;
}

/// An outstanding dataset read.
pub struct FetchHandle {
    dataset: String,
    future: BoxFuture<'static, Result<TypedArray>>,
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle").field("dataset", &self.dataset).finish_non_exhaustive()
    }
}

impl FetchHandle {
    /// Starts a read; it makes progress once the handle is joined.
    pub fn issue(fetcher: &Arc<dyn DatasetFetcher>, request: FetchRequest) -> Self {
        let fetcher = Arc::clone(fetcher);
        let dataset = request.dataset.clone();
        Self { dataset, future: Box::pin(async move { fetcher.read(request).await }) }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Waits up to `timeout` for the read.
    pub async fn join(self, timeout: Duration) -> Result<TypedArray> {
        match tokio::time::timeout(timeout, self.future).await {
            Err(_) => Err(TracklineError::DatasetFetchTimeout {
                dataset: self.dataset,
                duration: timeout,
            }),
            Ok(Ok(array)) => Ok(array),
            Ok(Err(
                e @ (TracklineError::DatasetFetchTimeout { .. }
                | TracklineError::DatasetFetchInvalid { .. }),
            )) => Err(e),
            Ok(Err(e)) => Err(TracklineError::DatasetFetchInvalid {
                dataset: self.dataset,
                reason: e.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredDataset {
    data: TypedArray,
    columns: usize,
}

/// Datasets held in memory, keyed by resource and dataset path.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    datasets: RwLock<HashMap<(String, String), StoredDataset>>,
    delay: Option<Duration>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every read sleeps for `delay` first.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::default() }
    }

    pub fn insert(&self, resource: &str, dataset: &str, data: TypedArray) {
        self.insert_2d(resource, dataset, data, 1);
    }

    /// Row-major 2-D dataset with `columns` values per row.
    pub fn insert_2d(&self, resource: &str, dataset: &str, data: TypedArray, columns: usize) {
        self.datasets.write().insert(
            (resource.to_string(), dataset.to_string()),
            StoredDataset { data, columns: columns.max(1) },
        );
    }

    pub fn contains(&self, resource: &str, dataset: &str) -> bool {
        self.datasets.read().contains_key(&(resource.to_string(), dataset.to_string()))
    }

    fn slice(&self, request: &FetchRequest) -> Result<TypedArray> {
        let invalid = |reason: String| TracklineError::DatasetFetchInvalid {
            dataset: format!("{}:{}", request.resource, request.dataset),
            reason,
        };

        let datasets = self.datasets.read();
        let stored = datasets
            .get(&(request.resource.clone(), request.dataset.clone()))
            .ok_or_else(|| invalid("dataset not found".to_string()))?;

        let columns = stored.columns;
        let rows = stored.data.len() / columns;
        if request.start_row > rows {
            return Err(invalid(format!("start row {} beyond {rows} rows", request.start_row)));
        }
        let num_rows = request.num_rows.unwrap_or(rows - request.start_row);
        let end = request.start_row + num_rows;
        if end > rows {
            return Err(invalid(format!("rows {}..{end} beyond {rows} rows", request.start_row)));
        }

        match request.column {
            Some(column) if column >= columns => {
                Err(invalid(format!("column {column} beyond {columns} columns")))
            }
            Some(column) => {
                Ok(stored.data.gather((request.start_row..end).map(|r| r * columns + column)))
            }
            None => Ok(stored.data.gather(request.start_row * columns..end * columns)),
        }
    }
}

#[async_trait::async_trait]
impl DatasetFetcher for MemoryFetcher {
    async fn read(&self, request: FetchRequest) -> Result<TypedArray> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.slice(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap()
    }

    fn fetcher() -> Arc<dyn DatasetFetcher> {
        let memory = MemoryFetcher::new();
        memory.insert("granule.h5", "gt1l/heights/h_ph", TypedArray::F32(vec![1.0, 2.0, 3.0, 4.0]));
        memory.insert_2d(
            "granule.h5",
            "gt1l/heights/signal_conf_ph",
            TypedArray::I8(vec![0, 1, 2, 3, 4, 4, 3, 2, 1, 0]),
            5,
        );
        Arc::new(memory)
    }

    #[test]
    fn reads_rows_and_columns() {
        let fetcher = fetcher();
        runtime().block_on(async {
            let all = FetchHandle::issue(&fetcher, FetchRequest::all("granule.h5", "gt1l/heights/h_ph"))
                .join(Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(all.len(), 4);
            assert_eq!(all.element_size(), 4);

            let rows = fetcher
                .read(FetchRequest::all("granule.h5", "gt1l/heights/h_ph").rows(1, 2))
                .await
                .unwrap();
            assert_eq!(rows.into_f64(), vec![2.0, 3.0]);

            let column = fetcher
                .read(FetchRequest::all("granule.h5", "gt1l/heights/signal_conf_ph").column(3))
                .await
                .unwrap();
            assert_eq!(column, TypedArray::I8(vec![3, 1]));
        });
    }

    #[test]
    fn missing_and_out_of_range_reads_are_invalid() {
        let fetcher = fetcher();
        runtime().block_on(async {
            let missing = FetchHandle::issue(&fetcher, FetchRequest::all("granule.h5", "gt2l/heights/h_ph"))
                .join(Duration::from_secs(1))
                .await;
            assert!(matches!(missing, Err(TracklineError::DatasetFetchInvalid { .. })));

            let beyond = fetcher
                .read(FetchRequest::all("granule.h5", "gt1l/heights/h_ph").rows(3, 5))
                .await;
            assert!(matches!(beyond, Err(TracklineError::DatasetFetchInvalid { .. })));

            let column = fetcher
                .read(FetchRequest::all("granule.h5", "gt1l/heights/signal_conf_ph").column(5))
                .await;
            assert!(column.is_err());
        });
    }

    #[test]
    fn slow_reads_time_out() {
        let memory = MemoryFetcher::with_delay(Duration::from_millis(500));
        memory.insert("g", "d", TypedArray::U8(vec![1]));
        let fetcher: Arc<dyn DatasetFetcher> = Arc::new(memory);
        let result = runtime().block_on(
            FetchHandle::issue(&fetcher, FetchRequest::all("g", "d")).join(Duration::from_millis(10)),
        );
        match result {
            Err(TracklineError::DatasetFetchTimeout { dataset, duration }) => {
                assert_eq!(dataset, "d");
                assert_eq!(duration, Duration::from_millis(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn conversions_use_as_semantics() {
        assert_eq!(TypedArray::F64(vec![1.9, -1.9]).into_i32(), vec![1, -1]);
        assert_eq!(TypedArray::I64(vec![300]).into_u8(), vec![44]);
        assert_eq!(TypedArray::I8(vec![-2]).type_name(), "int8");
    }
}
