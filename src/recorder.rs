// src/recorder.rs
//
// Persists the annotated image for every classified event and, for potholes
// and uncertain cases, one entry in the JSON detection log.

use crate::types::{CapturedFrame, DetectionResult, Label, LocationFix, LogEntry, RecorderConfig, VibrationEvent};
use anyhow::{Context, Result};
use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use serde_json::Value;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where one event's artifacts ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedPaths {
    pub image: PathBuf,
    /// Set only when a log entry was appended.
    pub log: Option<PathBuf>,
}

pub struct EventRecorder {
    output_dir: PathBuf,
    log_path: PathBuf,
    jpeg_quality: u8,
}

impl EventRecorder {
    /// Create the output tree (one subdirectory per label).
    pub fn new(config: &RecorderConfig) -> Result<Self> {
        let output_dir = PathBuf::from(&config.output_dir);
        for label in Label::ALL {
            let dir = output_dir.join(label.storage_dir());
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let log_path = PathBuf::from(&config.log_file);
        let existing = load_entries(&log_path).len();
        info!(
            "✓ Recorder ready: images → {}, log → {} ({} prior entries)",
            output_dir.display(),
            log_path.display(),
            existing
        );

        Ok(Self {
            output_dir,
            log_path,
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
        })
    }

    #[cfg(test)]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn image_dir(&self, label: Label) -> PathBuf {
        self.output_dir.join(label.storage_dir())
    }

    /// Write the annotated image, then append a log entry when the label is loggable.
    pub fn record(
        &self,
        frame: &CapturedFrame,
        result: &DetectionResult,
        event: &VibrationEvent,
        fix: &LocationFix,
    ) -> Result<PersistedPaths> {
        let image = self.image_path(result.label, frame)?;
        self.write_image(&image, result)?;
        debug!("saved {}", image.display());

        if !result.label.is_loggable() {
            return Ok(PersistedPaths { image, log: None });
        }

        let entry = LogEntry {
            timestamp: frame.captured_at,
            label: result.label,
            confidence: result.confidence,
            location: fix.clone(),
            vibration_magnitude: event.magnitude,
            image_path: image.clone(),
        };
        let total = append_log(&self.log_path, entry)?;
        debug!("log now holds {} entries", total);

        Ok(PersistedPaths {
            image,
            log: Some(self.log_path.clone()),
        })
    }

    /// `<label>_<date>_<time>_<micros>.jpg`, suffixed if the name is taken.
    fn image_path(&self, label: Label, frame: &CapturedFrame) -> Result<PathBuf> {
        let dir = self.image_dir(label);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let stem = format!(
            "{}_{}",
            label.as_str(),
            frame.captured_at.format("%Y%m%d_%H%M%S_%6f")
        );
        let mut path = dir.join(format!("{}.jpg", stem));
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("{}_{}.jpg", stem, n));
            n += 1;
        }
        Ok(path)
    }

    fn write_image(&self, path: &Path, result: &DetectionResult) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let encoder = JpegEncoder::new_with_quality(&mut writer, self.jpeg_quality);
        result
            .annotated
            .write_with_encoder(encoder)
            .with_context(|| format!("Failed to encode {}", path.display()))?;
        Ok(())
    }
}

/// What the log file at a path currently holds.
enum LogDocument {
    Entries(Vec<Value>),
    /// Present but not a JSON array; the reason is kept for the warning.
    Corrupt(String),
}

fn read_document(path: &Path) -> LogDocument {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LogDocument::Entries(Vec::new()),
        Err(e) => return LogDocument::Corrupt(e.to_string()),
    };
    if contents.trim().is_empty() {
        return LogDocument::Entries(Vec::new());
    }
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Array(entries)) => LogDocument::Entries(entries),
        Ok(other) => LogDocument::Corrupt(format!("top level is {}, not an array", json_kind(&other))),
        Err(e) => LogDocument::Corrupt(e.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Every element of the log at `path`, whatever its shape. Entries written
/// by other tools are returned untouched. A missing or corrupt file reads
/// as empty.
pub fn load_entries(path: &Path) -> Vec<Value> {
    match read_document(path) {
        LogDocument::Entries(entries) => entries,
        LogDocument::Corrupt(reason) => {
            warn!("recorder: {} is unreadable ({})", path.display(), reason);
            Vec::new()
        }
    }
}

/// The elements of the log that are detection entries in this crate's
/// format. Anything else is skipped here but stays on disk.
#[cfg(test)]
pub fn load_log(path: &Path) -> Vec<LogEntry> {
    load_entries(path)
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect()
}

/// Move a corrupt log aside as `<log>.corrupt-<date>_<time>` so the bytes
/// are never overwritten.
fn quarantine(path: &Path) -> Result<PathBuf> {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".corrupt-{}", Local::now().format("%Y%m%d_%H%M%S")));
    let mut target = path.with_file_name(&name);
    let mut n = 1;
    while target.exists() {
        let mut numbered = name.clone();
        numbered.push(format!("_{}", n));
        target = path.with_file_name(numbered);
        n += 1;
    }
    fs::rename(path, &target)
        .with_context(|| format!("Failed to move corrupt log {} aside", path.display()))?;
    Ok(target)
}

/// Read, append, rewrite. Existing elements are carried over as raw JSON.
/// The new document goes to a sibling temp file that is renamed over the
/// log, so a crash mid-write leaves the old log intact. Returns the element
/// count after the append.
pub fn append_log(path: &Path, entry: LogEntry) -> Result<usize> {
    let mut entries = match read_document(path) {
        LogDocument::Entries(entries) => entries,
        LogDocument::Corrupt(reason) => {
            let moved = quarantine(path)?;
            warn!(
                "recorder: {} is corrupt ({}), moved to {} and starting a fresh log",
                path.display(),
                reason,
                moved.display()
            );
            Vec::new()
        }
    };
    entries.push(serde_json::to_value(&entry).context("Failed to serialize log entry")?);

    let json = serde_json::to_string_pretty(&entries).context("Failed to serialize detection log")?;

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;

    Ok(entries.len())
}
