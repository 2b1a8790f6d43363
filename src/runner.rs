use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use indicatif::ProgressBar;
use log::{debug, error, info};

use crate::api::RestApi;
use crate::cache::{CacheStats, LookupCache};
use crate::config::{ConfigError, LoaderConfig};
use crate::entity::{EntityRegistry, ID};
use crate::pool::{PoolReport, WorkerPool};
use crate::record::{RecordLayout, Row};
use crate::sink::{ResultSink, RowResult};
use crate::task::{Command, Task, TaskContext};
use crate::totals::{Action, ActionTotals, TotalsSnapshot};

/// Rows between aggregate snapshots.
const SNAPSHOT_INTERVAL: usize = 111;

/// Sequential supplier of header-ordered rows.
pub trait RowSource: Iterator<Item = Result<Row>> {
    fn headers(&self) -> &[String];
}

pub struct CsvRowSource {
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<Box<dyn Read + Send>>,
    next_number: usize,
}

impl CsvRowSource {
    /// Opens a CSV file; `.gz` files are decompressed on the fly.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open input file: {}", path.display()))?;
        let reader: Box<dyn Read + Send> = if path.extension().map_or(false, |ext| ext == "gz") {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Self::from_reader(reader).with_context(|| format!("Failed to read CSV header from {}", path.display()))
    }

    pub fn from_reader(reader: Box<dyn Read + Send>) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = csv_reader.headers()?.iter().map(|h| h.trim_start_matches('\u{feff}').to_string()).collect();
        Ok(Self { headers, records: csv_reader.into_records(), next_number: 1 })
    }
}

impl Iterator for CsvRowSource {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        let number = self.next_number;
        self.next_number += 1;
        Some(
            record
                .map(|r| Row::new(number, r.iter().map(str::to_string).collect()))
                .with_context(|| format!("Malformed CSV row {}", number)),
        )
    }
}

impl RowSource for CsvRowSource {
    fn headers(&self) -> &[String] {
        &self.headers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Init,
    Streaming,
    Draining,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "INIT",
            RunState::Streaming => "STREAMING",
            RunState::Draining => "DRAINING",
            RunState::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub entity: String,
    pub rows: usize,
    pub totals: TotalsSnapshot,
    pub cache: CacheStats,
    pub pool: PoolReport,
    pub elapsed: Duration,
}

/// Drives one input through the worker pool.
pub struct ProcessRunner {
    command: Command,
    config: Arc<LoaderConfig>,
    registry: Arc<EntityRegistry>,
    api: Arc<dyn RestApi>,
    progress: ProgressBar,
}

impl ProcessRunner {
    pub fn new(command: Command, config: Arc<LoaderConfig>, registry: Arc<EntityRegistry>, api: Arc<dyn RestApi>) -> Self {
        Self { command, config, registry, api, progress: ProgressBar::hidden() }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn run<S: RowSource>(&self, entity_name: &str, source: S, sink: Arc<dyn ResultSink>) -> Result<RunSummary> {
        let started = Instant::now();
        let mut state = RunState::Init;
        info!("[{}] {} {}", state, self.command, entity_name);

        let entity = self.registry.resolve(entity_name)?;
        let exist_fields = self.config.exist_fields(entity.name());
        let has_id_column = source.headers().iter().any(|h| h.trim().eq_ignore_ascii_case(ID));
        let needs_exist_fields = match self.command {
            Command::Delete => !has_id_column,
            command => command.requires_exist_fields(),
        };
        if needs_exist_fields && exist_fields.is_empty() {
            return Err(ConfigError::MissingExistFields { command: self.command.to_string(), entity: entity.name().to_string() }.into());
        }
        let layout = RecordLayout::new(Arc::clone(&entity), source.headers(), exist_fields, &self.registry)?;

        let threads = self.config.worker_threads();
        let capacity = self.config.work_queue_capacity();
        info!("Using {} worker thread(s) with a work queue of {}", threads, capacity);
        let pool = WorkerPool::new(threads, capacity)?;
        let context = Arc::new(TaskContext {
            command: self.command,
            config: Arc::clone(&self.config),
            api: Arc::clone(&self.api),
            cache: Arc::new(LookupCache::new(&self.config.list_delimiter, self.config.wildcard_matching)),
            totals: Arc::new(ActionTotals::new()),
            sink: Arc::clone(&sink),
        });

        state = transition(state, RunState::Streaming);
        let mut rows = 0;
        for row in source {
            rows += 1;
            match row {
                Ok(row) => {
                    let task = Task::new(layout.record(row), Arc::clone(&context));
                    pool.submit(move || task.run());
                }
                Err(e) => {
                    error!("{:#}", e);
                    context.totals.increment(Action::Failure);
                    sink.write(RowResult {
                        row_number: rows,
                        action: Action::Failure,
                        id: None,
                        message: format!("{:#}", e),
                        values: vec![String::new(); layout.headers().len()],
                    });
                }
            }
            self.progress.inc(1);
            if rows % SNAPSHOT_INTERVAL == 0 {
                let snapshot = context.totals.snapshot();
                info!("Read {} rows; completed: {}", rows, snapshot);
                sink.snapshot(&snapshot);
            }
        }

        state = transition(state, RunState::Draining);
        let pool = pool.await_termination(self.config.drain_poll_interval());
        debug!("Pool finished: {:?}", pool);

        transition(state, RunState::Done);
        let totals = context.totals.snapshot();
        sink.snapshot(&totals);
        sink.finish()?;
        let summary = RunSummary {
            entity: entity.name().to_string(),
            rows,
            totals,
            cache: context.cache.stats(),
            pool,
            elapsed: started.elapsed(),
        };
        info!("{} {}: {} (cache hits {}, misses {})", self.command, summary.entity, summary.totals, summary.cache.hits, summary.cache.misses);
        Ok(summary)
    }
}

fn transition(from: RunState, to: RunState) -> RunState {
    info!("[{}] -> [{}]", from, to);
    to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntityConfig;
    use crate::sink::MemorySink;
    use crate::testing::MockApi;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    struct VecSource {
        headers: Vec<String>,
        rows: std::vec::IntoIter<Row>,
    }

    impl VecSource {
        fn new(headers: &[&str], rows: Vec<Vec<String>>) -> Self {
            let rows: Vec<Row> = rows.into_iter().enumerate().map(|(i, values)| Row::new(i + 1, values)).collect();
            Self { headers: headers.iter().map(|h| h.to_string()).collect(), rows: rows.into_iter() }
        }
    }

    impl Iterator for VecSource {
        type Item = Result<Row>;

        fn next(&mut self) -> Option<Self::Item> {
            self.rows.next().map(Ok)
        }
    }

    impl RowSource for VecSource {
        fn headers(&self) -> &[String] {
            &self.headers
        }
    }

    fn config(threads: usize, exist: &[&str]) -> Arc<LoaderConfig> {
        let mut config = LoaderConfig { num_threads: threads, queue_capacity: 1000, drain_poll_seconds: 1, ..LoaderConfig::default() };
        if !exist.is_empty() {
            config.entities.insert(
                "Candidate".to_string(),
                EntityConfig { exist_fields: exist.iter().map(|s| s.to_string()).collect(), ..EntityConfig::default() },
            );
        }
        Arc::new(config)
    }

    fn hundred_rows_with_ten_emails() -> VecSource {
        let rows = (0..100).map(|i| vec![format!("person{}@example.com", i % 10), format!("Last{}", i)]).collect();
        VecSource::new(&["email", "lastName"], rows)
    }

    fn runner(threads: usize, exist: &[&str], api: &Arc<MockApi>) -> ProcessRunner {
        ProcessRunner::new(Command::Load, config(threads, exist), Arc::new(EntityRegistry::builtin()), Arc::clone(api) as Arc<dyn RestApi>)
    }

    #[test]
    fn duplicate_criteria_share_one_search() {
        let api = Arc::new(MockApi::new());
        let sink = Arc::new(MemorySink::new());
        let summary = runner(1, &["email"], &api).run("Candidate", hundred_rows_with_ten_emails(), Arc::clone(&sink) as Arc<dyn ResultSink>).unwrap();

        assert_eq!(MockApi::count(&api.searches), 10);
        assert_eq!(summary.rows, 100);
        assert_eq!(summary.totals.processed(), 100);
        assert_eq!(summary.totals.inserted, 10);
        assert_eq!(summary.totals.updated, 90);
        assert_eq!(sink.rows().len(), 100);
        assert_eq!(summary.cache.hits, 90);
        assert!(sink.snapshots().len() >= 1);
    }

    #[test]
    fn concurrent_rows_share_one_lookup_and_insert_per_key() {
        for _ in 0..5 {
            let api = Arc::new(MockApi::new());
            let sink = Arc::new(MemorySink::new());
            let summary = runner(8, &["email"], &api).run("Candidate", hundred_rows_with_ten_emails(), Arc::clone(&sink) as Arc<dyn ResultSink>).unwrap();

            assert_eq!(MockApi::count(&api.searches), 10);
            assert_eq!(MockApi::count(&api.inserts), 10);
            assert_eq!(api.records("Candidate").len(), 10);
            assert_eq!((summary.totals.inserted, summary.totals.updated, summary.totals.failed), (10, 90, 0));
            let rows = sink.rows();
            assert_eq!(rows.iter().map(|r| r.row_number).collect::<Vec<_>>(), (1..=100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn configuration_errors_stop_before_any_row() {
        let api = Arc::new(MockApi::new());
        let sink = Arc::new(MemorySink::new());

        let export = ProcessRunner::new(Command::Export, config(1, &[]), Arc::new(EntityRegistry::builtin()), Arc::clone(&api) as Arc<dyn RestApi>);
        let err = export.run("Candidate", hundred_rows_with_ten_emails(), Arc::clone(&sink) as Arc<dyn ResultSink>).unwrap_err();
        assert_eq!(err.to_string(), "Cannot perform export because exist field is not specified for entity: Candidate");

        let source = VecSource::new(&["email", "city"], vec![vec!["a@b.com".to_string(), "Austin".to_string()]]);
        let err = runner(1, &["email"], &api).run("Candidate", source, Arc::clone(&sink) as Arc<dyn ResultSink>).unwrap_err();
        assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::BareAddressField { .. })));

        assert_eq!(MockApi::count(&api.searches), 0);
        assert!(sink.rows().is_empty());
    }

    #[test]
    fn delete_with_id_column_needs_no_exist_fields() {
        let api = Arc::new(MockApi::new().with_records("Candidate", vec![serde_json::json!({"id": 3})]));
        let sink = Arc::new(MemorySink::new());
        let runner = ProcessRunner::new(Command::Delete, config(1, &[]), Arc::new(EntityRegistry::builtin()), Arc::clone(&api) as Arc<dyn RestApi>);
        let source = VecSource::new(&["id"], vec![vec!["3".to_string()], vec!["3".to_string()], vec!["4".to_string()]]);

        let summary = runner.run("Candidate", source, Arc::clone(&sink) as Arc<dyn ResultSink>).unwrap();
        assert_eq!((summary.totals.deleted, summary.totals.failed), (1, 2));
        assert_eq!(MockApi::count(&api.deletes), 1);
        assert!(api.records("Candidate").is_empty());
        assert_eq!(sink.rows()[1].message, "No Matching Candidate Records Exist with ExistField criteria of: id=3");
    }

    #[test]
    fn csv_source_numbers_rows_and_reads_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("Candidates.csv");
        std::fs::write(&plain, "\u{feff}email,lastName\na@b.com,Smith\nc@d.com\n").unwrap();

        let mut source = CsvRowSource::open(&plain).unwrap();
        assert_eq!(source.headers(), ["email".to_string(), "lastName".to_string()]);
        let rows: Vec<Row> = source.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(rows, vec![Row::new(1, vec!["a@b.com".into(), "Smith".into()]), Row::new(2, vec!["c@d.com".into()])]);

        let gz = dir.path().join("Candidates.csv.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"email\nx@y.com\n").unwrap();
        std::fs::write(&gz, encoder.finish().unwrap()).unwrap();
        let rows: Vec<Row> = CsvRowSource::open(&gz).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(rows, vec![Row::new(1, vec!["x@y.com".into()])]);

        let source = CsvRowSource::from_reader(Box::new(Cursor::new(b"name\nJava\n".to_vec()))).unwrap();
        assert_eq!(source.count(), 1);
    }
}
