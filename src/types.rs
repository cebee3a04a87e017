use crate::surface::ClassifierConfig;
use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub gps: GpsConfig,
    pub camera: CameraConfig,
    pub classifier: ClassifierConfig,
    pub recorder: RecorderConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial device the vibration sensor writes to (already line-framed).
    pub port: String,
    /// Free-text phrase the sensor firmware prints on a vibration spike.
    pub marker_phrase: String,
    pub poll_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            marker_phrase: "Sudden vibration detected".to_string(),
            poll_interval_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsBackend {
    Gpsd,
    Nmea,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub backend: GpsBackend,
    pub gpsd_address: String,
    pub nmea_device: String,
    /// Maximum samples read per event before giving up.
    pub attempts: u32,
    pub attempt_timeout_ms: u64,
    /// Wall-clock cap on one fix request, whichever of this and `attempts` runs out first.
    pub budget_ms: u64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            backend: GpsBackend::Gpsd,
            gpsd_address: "127.0.0.1:2947".to_string(),
            nmea_device: "/dev/ttyUSB0".to_string(),
            attempts: 10,
            attempt_timeout_ms: 1000,
            budget_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraBackend {
    StillCommand,
    Replay,
    VideoDevice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub backend: CameraBackend,
    pub command: String,
    pub width: u32,
    pub height: u32,
    pub temp_path: String,
    /// Value handed to the still command's own `--timeout` flag (ms).
    pub timeout_ms: u64,
    /// Hard deadline on the capture subprocess before it is killed.
    pub trigger_timeout_ms: u64,
    pub replay_dir: String,
    pub device_index: i32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::StillCommand,
            command: "rpicam-still".to_string(),
            width: 1920,
            height: 1080,
            temp_path: "/tmp/capture.jpg".to_string(),
            timeout_ms: 1,
            trigger_timeout_ms: 10_000,
            replay_dir: "replay".to_string(),
            device_index: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub output_dir: String,
    pub log_file: String,
    pub jpeg_quality: u8,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: "pothole_images".to_string(),
            log_file: "pothole_gps_log.json".to_string(),
            jpeg_quality: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pause after each processed event so one bump is not reported twice.
    pub cooldown_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { cooldown_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ============================================================================
// PIPELINE DATA
// ============================================================================

/// One vibration notification parsed from the sensor link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VibrationEvent {
    pub magnitude: f64,
    pub raw_timestamp: String,
    pub sequence: u64,
}

/// A location sample. Every numeric field is independently optional;
/// "not available" is `None`, never a zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    #[serde(rename = "fix_quality_or_available")]
    pub available: bool,
    pub sampled_at: DateTime<Local>,
}

impl LocationFix {
    pub fn unavailable() -> Self {
        Self {
            latitude: None,
            longitude: None,
            altitude: None,
            speed: None,
            available: false,
            sampled_at: Local::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available && self.latitude.is_some() && self.longitude.is_some()
    }
}

impl std::fmt::Display for LocationFix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if self.is_available() => {
                write!(f, "{:.6}, {:.6}", lat, lon)?;
                if let Some(speed) = self.speed {
                    write!(f, " @ {:.2} m/s", speed)?;
                }
                Ok(())
            }
            _ => write!(f, "Location unavailable"),
        }
    }
}

/// A decoded still image (RGB, 8 bits per channel).
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: RgbImage,
    pub captured_at: DateTime<Local>,
}

impl CapturedFrame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Local::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Pothole,
    Uncertain,
    NonPothole,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Pothole => "pothole",
            Label::Uncertain => "uncertain",
            Label::NonPothole => "non_pothole",
        }
    }

    /// Subdirectory of the output dir the annotated image is filed under.
    pub fn storage_dir(&self) -> &'static str {
        match self {
            Label::Pothole => "potholes",
            Label::Uncertain => "uncertain",
            Label::NonPothole => "non_potholes",
        }
    }

    /// Only potholes and uncertain cases go into the structured log.
    pub fn is_loggable(&self) -> bool {
        matches!(self, Label::Pothole | Label::Uncertain)
    }

    pub const ALL: [Label; 3] = [Label::Pothole, Label::Uncertain, Label::NonPothole];
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub label: Label,
    /// Score of the best qualifying region, 0.0 when none qualified.
    pub confidence: f32,
    pub annotated: RgbImage,
    /// Regions that cleared the qualification cutoff.
    pub qualifying_regions: usize,
}

/// One row of the persisted detection log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub label: Label,
    pub confidence: f32,
    #[serde(rename = "locationFix")]
    pub location: LocationFix,
    pub vibration_magnitude: f64,
    pub image_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_field_names() {
        let entry = LogEntry {
            timestamp: Local::now(),
            label: Label::Pothole,
            confidence: 1.0,
            location: LocationFix::unavailable(),
            vibration_magnitude: 2.35,
            image_path: PathBuf::from("pothole_images/potholes/a.jpg"),
        };
        let value = serde_json::to_value(&entry).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        for key in ["timestamp", "label", "confidence", "locationFix", "vibrationMagnitude", "imagePath"] {
            assert!(keys.contains(&key), "missing {} in {:?}", key, keys);
        }
        assert_eq!(value["vibrationMagnitude"], 2.35);

        let fix = &value["locationFix"];
        assert_eq!(fix["fix_quality_or_available"], false);
        assert!(fix["latitude"].is_null());
        assert!(fix.get("sampled_at").is_some());
        assert!(fix.get("available").is_none());
    }

    #[test]
    fn test_fix_display() {
        let mut fix = LocationFix {
            latitude: Some(51.5),
            longitude: Some(-0.12),
            altitude: None,
            speed: Some(3.0),
            available: true,
            sampled_at: Local::now(),
        };
        assert_eq!(fix.to_string(), "51.500000, -0.120000 @ 3.00 m/s");
        fix.available = false;
        assert_eq!(fix.to_string(), "Location unavailable");
    }
}
