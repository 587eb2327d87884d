//! Append-only launch log.
//!
//! Each launch gets its own `Launch<N>.jsonl` file holding one encoded
//! [`TelemetryFrame`] per line, in the order frames were stored. Lines no
//! format recognized are stored and broadcast as zeroed frames but never
//! recorded.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::broadcast::FrameSink;
use crate::error::{Error, Result};
use crate::telemetry::TelemetryFrame;

/// File name used for a launch log.
#[must_use]
pub fn launch_file_name(launch_number: u32) -> String {
    format!("Launch{launch_number}.jsonl")
}

/// Appends every accepted frame to a launch log.
#[derive(Debug)]
pub struct Recorder {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl Recorder {
    /// Open (or create) the log for `launch_number` under `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn open(directory: &Path, launch_number: u32) -> Result<Self> {
        fs::create_dir_all(directory).map_err(|source| Error::DirectoryCreate {
            path: directory.to_path_buf(),
            source,
        })?;

        let path = directory.join(launch_file_name(launch_number));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "recording frames");

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Path of the launch log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn record(&self, frame: &TelemetryFrame) -> Result<()> {
        let line = frame.encode()?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

impl FrameSink for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn accept(&self, frame: &TelemetryFrame) {
        if let Err(err) = self.record(frame) {
            warn!(path = %self.path.display(), error = %err, "failed to record frame");
        }
    }

    fn accepts_unrecognized(&self) -> bool {
        false
    }
}

/// Read a launch log back, skipping lines that do not decode.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn read_launch_log(path: &Path) -> Result<Vec<TelemetryFrame>> {
    let reader = BufReader::new(File::open(path)?);
    let mut frames = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TelemetryFrame>(&line) {
            Ok(frame) => frames.push(frame),
            Err(err) => debug!(line = number + 1, error = %err, "skipping malformed record"),
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Field, Reading, Schema};

    fn frame(alt: f64) -> TelemetryFrame {
        let mut reading = Reading::zeroed(Schema::Environmental);
        reading.set(Field::Altitude, alt);
        TelemetryFrame::new(reading)
    }

    #[test]
    fn test_launch_file_name() {
        assert_eq!(launch_file_name(3), "Launch3.jsonl");
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("Launch_Data");
        let recorder = Recorder::open(&nested, 1).unwrap();
        assert!(nested.is_dir());
        assert_eq!(recorder.path(), nested.join("Launch1.jsonl"));
    }

    #[test]
    fn test_records_one_line_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::open(dir.path(), 7).unwrap();
        let frames = [frame(1.0), frame(2.0), frame(3.0)];
        for f in &frames {
            recorder.record(f).unwrap();
        }

        let contents = fs::read_to_string(recorder.path()).unwrap();
        assert_eq!(contents.lines().count(), 3);

        let first: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(first["alt"], 1.0);
        assert_eq!(first["schema"], "environmental");

        assert_eq!(read_launch_log(recorder.path()).unwrap(), frames);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        Recorder::open(dir.path(), 2).unwrap().record(&frame(1.0)).unwrap();
        Recorder::open(dir.path(), 2).unwrap().record(&frame(2.0)).unwrap();

        let frames = read_launch_log(&dir.path().join(launch_file_name(2))).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_read_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::open(dir.path(), 1).unwrap();
        recorder.accept(&frame(10.0));
        {
            let mut file = OpenOptions::new().append(true).open(recorder.path()).unwrap();
            writeln!(file, "{{'A': '450'}}").unwrap();
            writeln!(file).unwrap();
        }
        recorder.accept(&frame(20.0));

        let frames = read_launch_log(recorder.path()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].reading.get(Field::Altitude), Some(20.0));
    }
}
