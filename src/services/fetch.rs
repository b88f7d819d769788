//! Per-partition fetch worker.
//!
//! For every window the worker walks `FetchPage -> PersistBatch -> FetchPage ...`
//! until the API returns an empty page. Each non-empty page is committed on its
//! own together with the watermark advances it justifies, so a crash loses at
//! most the page in flight.

use crate::client::{ClientError, OrionClient};
use crate::db::models::NewReading;
use crate::models::orion::{SensorId, SensorReading};
use crate::services::partition::Partition;
use crate::transport::{HttpTransport, Sleeper};
use chrono::NaiveDateTime;
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

pub trait ReadingSource: Sync {
    fn fetch_page(
        &self,
        sensors: &[SensorId],
        window: &FetchWindow,
        offset: u64,
    ) -> Result<Vec<SensorReading>, ClientError>;
}

impl<T: HttpTransport> ReadingSource for OrionClient<T> {
    fn fetch_page(
        &self,
        sensors: &[SensorId],
        window: &FetchWindow,
        offset: u64,
    ) -> Result<Vec<SensorReading>, ClientError> {
        self.get_sensor_data(sensors, window.start, window.end, offset)
    }
}

/// Rows of one page ready to persist, plus the newest timestamp per sensor among them.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PageBatch {
    pub readings: Vec<NewReading>,
    pub advances: BTreeMap<SensorId, NaiveDateTime>,
}

pub trait ReadingSink {
    /// Persist `batch` atomically; returns the number of readings that were new.
    fn commit_page(&mut self, batch: &PageBatch) -> Result<usize, String>;
}

/// How `offset` moves between pages of the same window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetMode {
    /// offset += rows returned
    Rows,
    /// offset += 1
    Pages,
}

impl FromStr for OffsetMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rows" => Ok(OffsetMode::Rows),
            "pages" => Ok(OffsetMode::Pages),
            other => Err(format!("unknown offset mode {:?} (expected rows or pages)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub offset_mode: OffsetMode,
    pub page_delay: Duration,
    pub max_pages_per_window: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub pages: u64,
    pub fetched: usize,
    pub skipped: usize,
    pub inserted: usize,
}

#[derive(Debug)]
pub enum WorkerError {
    Fetch {
        window: FetchWindow,
        offset: u64,
        source: ClientError,
    },
    Persist {
        window: FetchWindow,
        offset: u64,
        message: String,
    },
    Runaway {
        window: FetchWindow,
        pages: u64,
    },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Fetch { window, offset, source } => {
                write!(f, "fetch {} offset {} failed: {}", window, offset, source)
            }
            WorkerError::Persist { window, offset, message } => {
                write!(f, "persist {} offset {} failed: {}", window, offset, message)
            }
            WorkerError::Runaway { window, pages } => {
                write!(f, "window {} still returning data after {} pages", window, pages)
            }
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Fetch { source, .. } => Some(source),
            _ => None,
        }
    }
}

enum State {
    FetchPage { offset: u64 },
    PersistBatch { offset: u64, page: Vec<SensorReading> },
    Done,
}

/// Keep rows for this partition that carry a value; track the newest timestamp per sensor.
pub fn build_batch(partition: &BTreeSet<SensorId>, page: &[SensorReading]) -> (PageBatch, usize) {
    let mut batch = PageBatch::default();
    let mut skipped = 0;
    for row in page {
        let Some(value) = row.sensor_value.filter(|_| partition.contains(&row.sensor_id)) else {
            skipped += 1;
            continue;
        };
        batch.readings.push(NewReading {
            sensor_id: row.sensor_id.0,
            data_leitura: row.reading_date,
            valor_sensor: value,
        });
        batch
            .advances
            .entry(row.sensor_id)
            .and_modify(|ts| *ts = (*ts).max(row.reading_date))
            .or_insert(row.reading_date);
    }
    (batch, skipped)
}

pub struct FetchWorker<'a, S, K, Z> {
    pub partition: &'a Partition,
    pub settings: &'a WorkerSettings,
    pub source: &'a S,
    pub sink: &'a mut K,
    pub sleeper: &'a Z,
}

impl<S: ReadingSource, K: ReadingSink, Z: Sleeper> FetchWorker<'_, S, K, Z> {
    /// Drain every window in order. Stops at the first fatal error.
    pub fn run(&mut self, windows: &[FetchWindow]) -> Result<WorkerReport, WorkerError> {
        let mut report = WorkerReport::default();
        for window in windows {
            self.run_window(window, &mut report)?;
        }
        info!(
            "Worker[{}]: done ({} page(s), {} fetched, {} inserted, {} skipped)",
            self.partition, report.pages, report.fetched, report.inserted, report.skipped
        );
        Ok(report)
    }

    fn run_window(&mut self, window: &FetchWindow, report: &mut WorkerReport) -> Result<(), WorkerError> {
        let members: BTreeSet<SensorId> = self.partition.sensors.iter().copied().collect();
        let mut pages = 0u64;
        let mut state = State::FetchPage { offset: 0 };

        loop {
            state = match state {
                State::FetchPage { offset } => {
                    if pages >= self.settings.max_pages_per_window {
                        return Err(WorkerError::Runaway { window: *window, pages });
                    }
                    let page = self
                        .source
                        .fetch_page(&self.partition.sensors, window, offset)
                        .map_err(|source| WorkerError::Fetch {
                            window: *window,
                            offset,
                            source,
                        })?;
                    pages += 1;
                    if page.is_empty() {
                        State::Done
                    } else {
                        State::PersistBatch { offset, page }
                    }
                }
                State::PersistBatch { offset, page } => {
                    let (batch, skipped) = build_batch(&members, &page);
                    let inserted = if batch.readings.is_empty() {
                        0
                    } else {
                        self.sink.commit_page(&batch).map_err(|message| WorkerError::Persist {
                            window: *window,
                            offset,
                            message,
                        })?
                    };
                    debug!(
                        "Worker[{}]: offset {} -> {} row(s), {} new, {} skipped",
                        self.partition,
                        offset,
                        page.len(),
                        inserted,
                        skipped
                    );
                    report.pages += 1;
                    report.fetched += page.len();
                    report.skipped += skipped;
                    report.inserted += inserted;

                    let next = match self.settings.offset_mode {
                        OffsetMode::Rows => offset + page.len() as u64,
                        OffsetMode::Pages => offset + 1,
                    };
                    self.sleeper.sleep(self.settings.page_delay);
                    State::FetchPage { offset: next }
                }
                State::Done => return Ok(()),
            };
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory stand-in for `leituras` + `sync_state` with the same conflict rules.
    #[derive(Default)]
    pub struct MemoryDb {
        pub readings: BTreeMap<(SensorId, NaiveDateTime), f64>,
        pub watermarks: BTreeMap<SensorId, NaiveDateTime>,
        pub commits: usize,
        pub fail_on_commit: Option<usize>,
    }

    impl MemoryDb {
        pub fn max_reading(&self, sensor: SensorId) -> Option<NaiveDateTime> {
            self.readings.keys().filter(|(s, _)| *s == sensor).map(|(_, ts)| *ts).max()
        }
    }

    impl ReadingSink for MemoryDb {
        fn commit_page(&mut self, batch: &PageBatch) -> Result<usize, String> {
            self.commits += 1;
            if self.fail_on_commit == Some(self.commits) {
                return Err("connection reset".to_string());
            }
            let mut inserted = 0;
            for r in &batch.readings {
                let key = (SensorId(r.sensor_id), r.data_leitura);
                if !self.readings.contains_key(&key) {
                    self.readings.insert(key, r.valor_sensor);
                    inserted += 1;
                }
            }
            for (s, ts) in &batch.advances {
                let entry = self.watermarks.entry(*s).or_insert(*ts);
                *entry = (*entry).max(*ts);
            }
            Ok(inserted)
        }
    }

    /// Serves a fixed dataset filtered by window, `page_size` rows per request.
    pub struct PagedSource {
        pub rows: Vec<SensorReading>,
        pub page_size: usize,
        pub requests: Mutex<Vec<(Vec<SensorId>, FetchWindow, u64)>>,
        pub fail_for: Option<SensorId>,
    }

    impl PagedSource {
        pub fn new(rows: Vec<SensorReading>, page_size: usize) -> Self {
            PagedSource {
                rows,
                page_size,
                requests: Mutex::new(Vec::new()),
                fail_for: None,
            }
        }
    }

    impl ReadingSource for PagedSource {
        fn fetch_page(
            &self,
            sensors: &[SensorId],
            window: &FetchWindow,
            offset: u64,
        ) -> Result<Vec<SensorReading>, ClientError> {
            self.requests.lock().unwrap().push((sensors.to_vec(), *window, offset));
            if let Some(bad) = self.fail_for
                && sensors.contains(&bad)
            {
                return Err(ClientError::Decode {
                    path: "[0].sensorValue".to_string(),
                    message: "invalid type: string".to_string(),
                });
            }
            let matching: Vec<SensorReading> = self
                .rows
                .iter()
                .filter(|r| sensors.contains(&r.sensor_id))
                .filter(|r| r.reading_date >= window.start && r.reading_date <= window.end)
                .cloned()
                .collect();
            Ok(matching.into_iter().skip(offset as usize).take(self.page_size).collect())
        }
    }

    pub fn reading(sensor: i64, ts: NaiveDateTime, value: f64) -> SensorReading {
        SensorReading {
            sensor_id: SensorId(sensor),
            reading_date: ts,
            sensor_value: Some(value),
        }
    }
}
