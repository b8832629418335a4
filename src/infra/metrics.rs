// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Records every validation cycle as one row of a CSV file.
//
// Columns are fixed by the first row written (the enabled heads
// never change during a run), and re-read from the header when
// a resumed run appends to an existing file:
//
//   step,WMT19_MCC,gap_tags_F1_BAD,...,loss
//   400,0.312000,0.201000,...,1.902000
//
// Metrics missing from a later row are left empty.
//
// Output file: <output_dir>/metrics.csv
//
// Reference: Rust Book §12 (I/O and File Handling)

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::domain::error::QeResult;
use crate::domain::metrics::MetricValues;

/// Logs validation metrics to a CSV file for later analysis.
pub struct MetricsLogger {
    csv_path: PathBuf,
    columns:  Option<Vec<String>>,
}

impl MetricsLogger {
    /// Create a new MetricsLogger writing to `<dir>/metrics.csv`.
    pub fn new(dir: &Path) -> QeResult<Self> {
        fs::create_dir_all(dir)?;
        let csv_path = dir.join("metrics.csv");

        // An existing file keeps its header so rows stay aligned.
        let columns = match fs::read_to_string(&csv_path) {
            Ok(text) => text.lines().next().map(|header| {
                header.split(',').skip(1).map(str::to_string).collect()
            }),
            Err(_) => None,
        };

        Ok(Self { csv_path, columns })
    }

    /// Append one validation cycle as a CSV row.
    pub fn log(&mut self, step: usize, metrics: &MetricValues) -> QeResult<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)?;

        let columns = match &self.columns {
            Some(columns) => columns.clone(),
            None => {
                let columns: Vec<String> = metrics.keys().cloned().collect();
                writeln!(f, "step,{}", columns.join(","))?;
                tracing::debug!("Created metrics CSV: '{}'", self.csv_path.display());
                self.columns = Some(columns.clone());
                columns
            }
        };

        let row: Vec<String> = columns
            .iter()
            .map(|name| metrics.get(name).map(|v| format!("{v:.6}")).unwrap_or_default())
            .collect();
        writeln!(f, "{},{}", step, row.join(","))?;
        Ok(())
    }

    /// Return the path to the metrics CSV file
    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}
