use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use csv::Writer;
use log::{debug, error, info};

use crate::totals::{Action, TotalsSnapshot};

const CHANNEL_CAPACITY: usize = 1024;

/// The outcome of one input row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowResult {
    pub row_number: usize,
    pub action: Action,
    pub id: Option<i64>,
    pub message: String,
    /// The input cells, or for exports the values read back from the remote system.
    pub values: Vec<String>,
}

impl RowResult {
    pub fn is_success(&self) -> bool {
        !self.action.is_failure()
    }
}

/// Receives per-row outcomes from any worker thread.
pub trait ResultSink: Send + Sync {
    fn write(&self, result: RowResult);
    fn snapshot(&self, totals: &TotalsSnapshot);
    fn finish(&self) -> Result<()>;
}

/// Output files for one input file and command.
#[derive(Debug, Clone)]
pub struct ResultPaths {
    pub success: PathBuf,
    pub failure: PathBuf,
    pub totals: PathBuf,
}

impl ResultPaths {
    pub fn new(results_dir: &Path, input: &Path, command: &str, timestamp: &str) -> Self {
        let stem = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .map(|n| n.trim_end_matches(".gz").trim_end_matches(".csv").to_string())
            .unwrap_or_else(|| "input".to_string());
        let base = format!("{}_{}_{}", stem, command, timestamp);
        Self {
            success: results_dir.join(format!("{}_success.csv", base)),
            failure: results_dir.join(format!("{}_failure.csv", base)),
            totals: results_dir.join(format!("{}_totals.json", base)),
        }
    }
}

enum SinkMessage {
    Row(RowResult),
    Snapshot(TotalsSnapshot),
    Close,
}

#[derive(Debug, Default)]
pub struct SinkReport {
    pub success_rows: usize,
    pub failure_rows: usize,
    /// Results that could not be written to disk.
    pub write_errors: usize,
}

/// Writes success and failure CSV files from a dedicated writer thread.
pub struct CsvResultSink {
    sender: Sender<SinkMessage>,
    writer: Mutex<Option<JoinHandle<Result<SinkReport>>>>,
}

impl CsvResultSink {
    pub fn new(paths: ResultPaths, headers: Vec<String>) -> Result<Self> {
        if let Some(dir) = paths.success.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create results directory: {}", dir.display()))?;
        }
        let (sender, receiver): (Sender<SinkMessage>, Receiver<SinkMessage>) = bounded(CHANNEL_CAPACITY);
        let writer = thread::Builder::new()
            .name("result-writer".to_string())
            .spawn(move || write_results(receiver, paths, headers))
            .context("Failed to spawn result writer thread")?;
        Ok(Self { sender, writer: Mutex::new(Some(writer)) })
    }
}

impl ResultSink for CsvResultSink {
    fn write(&self, result: RowResult) {
        if let Err(e) = self.sender.send(SinkMessage::Row(result)) {
            error!("Failed to send row result to writer thread: {}. Writer likely stopped.", e);
        }
    }

    fn snapshot(&self, totals: &TotalsSnapshot) {
        if let Err(e) = self.sender.send(SinkMessage::Snapshot(*totals)) {
            error!("Failed to send totals snapshot to writer thread: {}", e);
        }
    }

    fn finish(&self) -> Result<()> {
        let handle = match self.writer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return Ok(());
        };
        // A writer that already stopped has dropped its receiver; the join below reports why.
        let _ = self.sender.send(SinkMessage::Close);
        match handle.join() {
            Ok(Ok(report)) if report.write_errors > 0 => {
                Err(anyhow!("Result writer failed to write {} result(s); see the log for details", report.write_errors))
            }
            Ok(Ok(report)) => {
                info!("Result writer finished: {} success row(s), {} failure row(s).", report.success_rows, report.failure_rows);
                Ok(())
            }
            Ok(Err(e)) => Err(e.context("Result writer failed")),
            Err(_) => Err(anyhow!("Result writer thread panicked")),
        }
    }
}

struct ResultFiles {
    paths: ResultPaths,
    headers: Vec<String>,
    success: Option<Writer<File>>,
    failure: Option<Writer<File>>,
    report: SinkReport,
}

impl ResultFiles {
    fn open(path: &Path, first: &str, second: &str, headers: &[String]) -> Result<Writer<File>> {
        let file = File::create(path).with_context(|| format!("Failed to create results file: {}", path.display()))?;
        let mut writer = Writer::from_writer(file);
        let mut header_row = vec![first.to_string(), second.to_string()];
        header_row.extend(headers.iter().cloned());
        writer.write_record(&header_row)?;
        debug!("Created results file {}", path.display());
        Ok(writer)
    }

    fn write_row(&mut self, result: RowResult) -> Result<()> {
        let id = result.id.map(|id| id.to_string()).unwrap_or_default();
        let (writer, second) = if result.is_success() {
            if self.success.is_none() {
                self.success = Some(Self::open(&self.paths.success, "id", "action", &self.headers)?);
            }
            self.report.success_rows += 1;
            (self.success.as_mut(), result.action.to_string())
        } else {
            if self.failure.is_none() {
                self.failure = Some(Self::open(&self.paths.failure, "id", "reason", &self.headers)?);
            }
            self.report.failure_rows += 1;
            (self.failure.as_mut(), result.message.clone())
        };
        let writer = writer.ok_or_else(|| anyhow!("results writer was not opened"))?;
        let mut record = vec![id, second];
        record.extend(result.values);
        writer.write_record(&record)?;
        writer.flush()?;
        Ok(())
    }

    fn write_totals(&self, totals: &TotalsSnapshot) -> Result<()> {
        let file = File::create(&self.paths.totals).with_context(|| format!("Failed to create totals file: {}", self.paths.totals.display()))?;
        serde_json::to_writer_pretty(file, totals)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for writer in [self.success.as_mut(), self.failure.as_mut()].into_iter().flatten() {
            writer.flush()?;
        }
        Ok(())
    }
}

fn write_results(receiver: Receiver<SinkMessage>, paths: ResultPaths, headers: Vec<String>) -> Result<SinkReport> {
    info!("Result writer thread started.");
    let mut files = ResultFiles { paths, headers, success: None, failure: None, report: SinkReport::default() };
    for message in receiver {
        match message {
            SinkMessage::Row(result) => {
                let row_number = result.row_number;
                if let Err(e) = files.write_row(result) {
                    error!("Result writer error on row {}: {:#}", row_number, e);
                    files.report.write_errors += 1;
                }
            }
            SinkMessage::Snapshot(totals) => {
                if let Err(e) = files.write_totals(&totals) {
                    error!("Result writer error writing totals: {:#}", e);
                    files.report.write_errors += 1;
                }
            }
            SinkMessage::Close => break,
        }
    }
    files.flush()?;
    Ok(files.report)
}

/// Collects results in memory. Used by library callers that handle output themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<RowResult>>,
    snapshots: Mutex<Vec<TotalsSnapshot>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows ordered by row number.
    pub fn rows(&self) -> Vec<RowResult> {
        let mut rows = match self.rows.lock() {
            Ok(rows) => rows.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        rows.sort_by_key(|r| r.row_number);
        rows
    }

    pub fn snapshots(&self) -> Vec<TotalsSnapshot> {
        match self.snapshots.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ResultSink for MemorySink {
    fn write(&self, result: RowResult) {
        match self.rows.lock() {
            Ok(mut rows) => rows.push(result),
            Err(poisoned) => poisoned.into_inner().push(result),
        }
    }

    fn snapshot(&self, totals: &TotalsSnapshot) {
        match self.snapshots.lock() {
            Ok(mut s) => s.push(*totals),
            Err(poisoned) => poisoned.into_inner().push(*totals),
        }
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(row_number: usize, action: Action, id: Option<i64>, message: &str) -> RowResult {
        RowResult { row_number, action, id, message: message.to_string(), values: vec![format!("row{}@example.com", row_number), "Smith".to_string()] }
    }

    #[test]
    fn result_paths_use_input_stem_and_command() {
        let paths = ResultPaths::new(Path::new("results"), Path::new("/data/Candidates.csv.gz"), "load", "2024-01-02_03.04.05");
        assert_eq!(paths.success, Path::new("results/Candidates_load_2024-01-02_03.04.05_success.csv"));
        assert_eq!(paths.failure, Path::new("results/Candidates_load_2024-01-02_03.04.05_failure.csv"));
    }

    #[test]
    fn writes_success_and_failure_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ResultPaths::new(dir.path(), Path::new("Candidates.csv"), "load", "ts");
        let sink = CsvResultSink::new(paths.clone(), vec!["email".to_string(), "lastName".to_string()]).unwrap();

        sink.write(result(1, Action::Insert, Some(10), ""));
        sink.write(result(2, Action::Failure, None, "Multiple Records Exist"));
        sink.write(result(3, Action::Update, Some(11), ""));
        sink.snapshot(&TotalsSnapshot { inserted: 1, updated: 1, failed: 1, ..TotalsSnapshot::default() });
        sink.finish().unwrap();
        sink.finish().unwrap();

        let success = fs::read_to_string(&paths.success).unwrap();
        assert_eq!(success, "id,action,email,lastName\n10,INSERT,row1@example.com,Smith\n11,UPDATE,row3@example.com,Smith\n");
        let failure = fs::read_to_string(&paths.failure).unwrap();
        assert_eq!(failure, "id,reason,email,lastName\n,Multiple Records Exist,row2@example.com,Smith\n");

        let totals: serde_json::Value = serde_json::from_str(&fs::read_to_string(&paths.totals).unwrap()).unwrap();
        assert_eq!(totals["inserted"], 1);
        assert_eq!(totals["failed"], 1);
    }

    #[test]
    fn files_are_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ResultPaths::new(dir.path(), Path::new("Skills.csv"), "delete", "ts");
        let sink = CsvResultSink::new(paths.clone(), vec!["name".to_string(), "description".to_string()]).unwrap();
        sink.write(result(1, Action::Delete, Some(3), ""));
        sink.finish().unwrap();

        assert!(paths.success.exists());
        assert!(!paths.failure.exists());
    }

    #[test]
    fn unwritable_results_fail_finish() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ResultPaths::new(dir.path(), Path::new("Candidates.csv"), "load", "ts");
        // A directory where the success file should go makes every success write fail.
        fs::create_dir_all(&paths.success).unwrap();
        let sink = CsvResultSink::new(paths.clone(), vec!["email".to_string(), "lastName".to_string()]).unwrap();

        sink.write(result(1, Action::Insert, Some(10), ""));
        sink.write(result(2, Action::Failure, None, "No Matching"));
        let err = sink.finish().unwrap_err();
        assert!(err.to_string().contains("failed to write 1 result(s)"), "{}", err);
        assert!(paths.failure.exists());
    }

    #[test]
    fn memory_sink_orders_rows() {
        let sink = MemorySink::new();
        sink.write(result(2, Action::Update, Some(2), ""));
        sink.write(result(1, Action::Insert, Some(1), ""));
        let numbers: Vec<usize> = sink.rows().iter().map(|r| r.row_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }
}
