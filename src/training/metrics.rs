/// Epoch-level metric accumulation and the per-epoch CSV log
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Running sums for one pass over a data split
///
/// Reset at the start of every epoch; loss is weighted by batch size.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    loss_sum: f64,
    correct: usize,
    count: usize,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch with mean loss `loss` over `batch_size` samples
    pub fn add(&mut self, loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.count += batch_size;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Sample-weighted mean loss, 0 when nothing was accumulated
    pub fn mean_loss(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.loss_sum / self.count as f64
        }
    }

    /// Fraction of correct predictions, 0 when nothing was accumulated
    pub fn accuracy(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.correct as f64 / self.count as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One row of the metrics table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub valid_loss: f64,
    pub train_acc: f64,
    pub valid_acc: f64,
    pub friction: f64,
}

/// Cumulative metrics table, rewritten in full after every epoch
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
    records: Vec<EpochRecord>,
}

impl MetricsLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    /// Append a row and rewrite the whole file
    pub fn append(&mut self, record: EpochRecord) -> crate::Result<()> {
        self.records.push(record);
        self.write()
    }

    fn write(&self) -> crate::Result<()> {
        let file = BufWriter::new(File::create(&self.path)?);
        let mut writer = csv::Writer::from_writer(file);
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a metrics table back
    pub fn read<P: AsRef<Path>>(path: P) -> crate::Result<Vec<EpochRecord>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            records.push(row?);
        }
        Ok(records)
    }
}
