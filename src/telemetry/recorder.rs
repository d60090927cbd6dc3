//! # Telemetry Recorder
//!
//! Writes telemetry messages to rotating JSONL (JSON Lines) files.
//!
//! Each record is the decoded message object with a `recordedAt` timestamp
//! added. A new file is started every `max_records_per_file` records; only
//! the newest `max_files_to_keep` files are retained.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::channel::{Subscription, TelemetryChannel};
use super::message::TelemetryMessage;
use crate::config::TelemetryConfig;
use crate::error::Result;

const FILE_PREFIX: &str = "telemetry-";
const FILE_SUFFIX: &str = ".jsonl";

struct State {
    writer: Option<BufWriter<File>>,
    records_in_file: usize,
    files: VecDeque<PathBuf>,
    sequence: u64,
}

/// Rotating JSONL sink for telemetry messages.
pub struct TelemetryRecorder {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    state: Mutex<State>,
}

impl std::fmt::Debug for TelemetryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryRecorder")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl TelemetryRecorder {
    /// Creates the log directory if needed and picks up files left by
    /// earlier runs so retention covers them too.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or listed
    pub fn open(config: &TelemetryConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.log_dir);
        fs::create_dir_all(&dir)?;

        let mut existing: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_recording(path))
            .collect();
        existing.sort();

        info!(dir = %dir.display(), existing = existing.len(), "telemetry recorder ready");

        Ok(Self {
            dir,
            max_records_per_file: config.max_records_per_file.max(1),
            max_files_to_keep: config.max_files_to_keep.max(1),
            state: Mutex::new(State {
                writer: None,
                records_in_file: 0,
                files: existing.into(),
                sequence: 0,
            }),
        })
    }

    /// Subscribes the recorder to `"telemetry"` messages on `channel`.
    pub fn attach(self: &Arc<Self>, channel: &TelemetryChannel) -> Subscription {
        let recorder = Arc::clone(self);
        channel.subscribe("telemetry", move |message| {
            if let Err(e) = recorder.record(message, Utc::now()) {
                warn!(error = %e, "failed to record telemetry");
            }
        })
    }

    /// Appends one message.
    pub fn record(&self, message: &TelemetryMessage, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if state.writer.is_none() || state.records_in_file >= self.max_records_per_file {
            self.rotate(&mut state, at)?;
        }

        let mut record = message.body.clone();
        if let Value::Object(map) = &mut record {
            map.insert("recordedAt".to_string(), Value::String(at.to_rfc3339()));
        }

        if let Some(writer) = state.writer.as_mut() {
            serde_json::to_writer(&mut *writer, &record).map_err(std::io::Error::from)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        state.records_in_file += 1;

        Ok(())
    }

    /// Paths of the retained files, oldest first.
    pub fn files(&self) -> Vec<PathBuf> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.files.iter().cloned().collect()
    }

    fn rotate(&self, state: &mut State, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut old) = state.writer.take() {
            old.flush()?;
        }

        state.sequence += 1;
        let name = format!(
            "{}{}-{:04}{}",
            FILE_PREFIX,
            at.format("%Y%m%dT%H%M%S%.3fZ"),
            state.sequence,
            FILE_SUFFIX
        );
        let path = self.dir.join(name);
        let file = File::create(&path)?;
        debug!(path = %path.display(), "started telemetry file");

        state.writer = Some(BufWriter::new(file));
        state.records_in_file = 0;
        state.files.push_back(path);

        while state.files.len() > self.max_files_to_keep {
            if let Some(oldest) = state.files.pop_front() {
                if let Err(e) = fs::remove_file(&oldest) {
                    warn!(path = %oldest.display(), error = %e, "could not remove old telemetry file");
                }
            }
        }

        Ok(())
    }
}

fn is_recording(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::message::decode_frame;
    use tempfile::TempDir;

    fn config(dir: &TempDir, per_file: usize, keep: usize) -> TelemetryConfig {
        TelemetryConfig {
            record: true,
            log_dir: dir.path().to_string_lossy().to_string(),
            max_records_per_file: per_file,
            max_files_to_keep: keep,
            ..TelemetryConfig::default()
        }
    }

    fn message(roll: f64) -> TelemetryMessage {
        decode_frame(&format!(r#"{{"type":"telemetry","roll":{}}}"#, roll))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_records_are_json_lines() {
        let dir = TempDir::new().unwrap();
        let recorder = TelemetryRecorder::open(&config(&dir, 100, 5)).unwrap();

        recorder.record(&message(1.0), Utc::now()).unwrap();
        recorder.record(&message(2.0), Utc::now()).unwrap();

        let files = recorder.files();
        assert_eq!(files.len(), 1);

        let contents = fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["roll"], 2.0);
        assert!(lines[0]["recordedAt"].is_string());
    }

    #[test]
    fn test_rotation_and_retention() {
        let dir = TempDir::new().unwrap();
        let recorder = TelemetryRecorder::open(&config(&dir, 2, 2)).unwrap();

        for n in 0..7 {
            recorder.record(&message(n as f64), Utc::now()).unwrap();
        }

        // 7 records at 2 per file = 4 files, of which the newest 2 are kept
        let files = recorder.files();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.exists()));

        let on_disk = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(on_disk, 2);

        let last = fs::read_to_string(&files[1]).unwrap();
        assert_eq!(last.lines().count(), 1);
    }

    #[test]
    fn test_existing_files_count_toward_retention() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("telemetry-20200101T000000.000Z-0001.jsonl"), "{}\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let recorder = TelemetryRecorder::open(&config(&dir, 10, 1)).unwrap();
        recorder.record(&message(0.5), Utc::now()).unwrap();

        assert!(!dir.path().join("telemetry-20200101T000000.000Z-0001.jsonl").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(recorder.files().len(), 1);
    }

    #[test]
    fn test_attach_records_only_telemetry() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(TelemetryRecorder::open(&config(&dir, 10, 2)).unwrap());
        let channel = TelemetryChannel::new(
            Arc::new(crate::telemetry::channel::mocks::ScriptedConnector::default()),
            std::time::Duration::from_secs(2),
        );

        let _sub = recorder.attach(&channel);
        channel.handle_frame(crate::telemetry::channel::Frame::Text(
            r#"{"type":"telemetry","roll":4.0}"#.into(),
        ));
        channel.handle_frame(crate::telemetry::channel::Frame::Text(
            r#"{"type":"battery","voltages":[1.0]}"#.into(),
        ));

        let files = recorder.files();
        assert_eq!(files.len(), 1);
        assert_eq!(fs::read_to_string(&files[0]).unwrap().lines().count(), 1);
    }
}
