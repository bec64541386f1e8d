use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Local;
use tracing::{debug, info};

use crate::config::CsvConfig;
use crate::record::Record;

use super::table;

/// Upper bound on `_N` suffixes tried when a file name is already taken.
const MAX_NAME_SUFFIX: u32 = 1000;

/// Writes one CSV file per metric under a local directory.
pub struct CsvSink {
    output_dir: PathBuf,
    writers: HashMap<String, MetricFile>,
}

struct MetricFile {
    path: PathBuf,
    writer: ::csv::Writer<BufWriter<File>>,
}

impl CsvSink {
    /// Creates the sink, creating `output_dir` if missing.
    pub fn new(cfg: &CsvConfig) -> Result<Self> {
        std::fs::create_dir_all(&cfg.output_dir).with_context(|| {
            format!("creating output directory {}", cfg.output_dir.display())
        })?;

        Ok(Self {
            output_dir: cfg.output_dir.clone(),
            writers: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        "csv"
    }

    /// Paths of the files opened so far, keyed by metric.
    pub fn paths(&self) -> HashMap<&str, &Path> {
        self.writers
            .iter()
            .map(|(metric, file)| (metric.as_str(), file.path.as_path()))
            .collect()
    }

    pub async fn write(&mut self, metric: &str, records: Vec<Record>) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };

        if !self.writers.contains_key(metric) {
            let file = self.open(metric, first)?;
            self.writers.insert(metric.to_string(), file);
        }

        let Some(file) = self.writers.get_mut(metric) else {
            return Ok(());
        };

        table::write_rows(&mut file.writer, &records)
            .with_context(|| format!("writing {}", file.path.display()))?;
        file.writer
            .flush()
            .with_context(|| format!("flushing {}", file.path.display()))?;

        debug!(metric, records = records.len(), path = %file.path.display(), "wrote CSV rows");

        Ok(())
    }

    /// Flushes and closes every file, returning the last error seen.
    pub async fn close(&mut self) -> Result<()> {
        let mut last_err = None;

        for (metric, mut file) in self.writers.drain() {
            if let Err(e) = file.writer.flush() {
                last_err = Some(
                    anyhow::Error::from(e)
                        .context(format!("closing {} for {metric}", file.path.display())),
                );
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn open(&self, metric: &str, first: &Record) -> Result<MetricFile> {
        let base = format!(
            "{}_{}",
            file_stem(metric),
            Local::now().format("%Y%m%d%H%M%S")
        );
        let (path, handle) = self.create_unique(&base)?;

        let mut writer = table::writer(BufWriter::new(handle));
        writer
            .write_record(table::header(first))
            .with_context(|| format!("writing header to {}", path.display()))?;

        info!(metric, path = %path.display(), "opened CSV output");

        Ok(MetricFile { path, writer })
    }

    /// Creates `{base}.csv`, or `{base}_N.csv` when that name is taken.
    /// Never truncates an existing file.
    fn create_unique(&self, base: &str) -> Result<(PathBuf, File)> {
        for n in 0..=MAX_NAME_SUFFIX {
            let filename = if n == 0 {
                format!("{base}.csv")
            } else {
                format!("{base}_{n}.csv")
            };
            let path = self.output_dir.join(filename);

            match File::options().write(true).create_new(true).open(&path) {
                Ok(handle) => return Ok((path, handle)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("creating {}", path.display()));
                }
            }
        }

        bail!("no free file name for {base} in {}", self.output_dir.display())
    }
}

/// Metric name made safe for use as a file name.
fn file_stem(metric: &str) -> String {
    metric
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}
