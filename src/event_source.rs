// src/event_source.rs
//
// Vibration events from the sensor MCU. The link is already newline-framed;
// this module turns lines into `VibrationEvent`s and never blocks the caller.

use crate::link::{self, EofPolicy, LineReader, LinkMessage};
use crate::types::{LinkConfig, VibrationEvent};
use chrono::Local;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::TryRecvError;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAGNITUDE_TOKEN: &str = "Magnitude:";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("sensor link {port} unavailable: {source}")]
    Unavailable {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("sensor link {port} disconnected: {reason}")]
    Disconnected { port: String, reason: String },
}

/// What a single sensor line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Event {
        magnitude: f64,
        raw_timestamp: Option<String>,
    },
    /// Looked like an event but carried no usable magnitude.
    Malformed(&'static str),
    /// Anything else the firmware prints.
    Activity,
    Empty,
}

fn parse_magnitude(text: &str) -> Option<f64> {
    let value: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'))
        .collect();
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Accepts `EVENT,<delta>,<timestamp>` and marker-phrase lines carrying
/// `Magnitude: <value>`. A magnitude printed without the marker (calibration
/// dumps, IMU chatter) is not an event. An empty marker accepts any
/// magnitude line.
pub fn parse_line(line: &str, marker_phrase: &str) -> ParsedLine {
    let line = line.trim();
    if line.is_empty() {
        return ParsedLine::Empty;
    }

    if let Some(rest) = line.strip_prefix("EVENT,") {
        let mut fields = rest.splitn(2, ',');
        let magnitude = fields.next().and_then(parse_magnitude_exact);
        let timestamp = fields.next().map(str::trim).filter(|t| !t.is_empty());
        return match (magnitude, timestamp) {
            (Some(magnitude), Some(ts)) => ParsedLine::Event {
                magnitude,
                raw_timestamp: Some(ts.to_string()),
            },
            _ => ParsedLine::Malformed("EVENT line without delta and timestamp"),
        };
    }

    let marked = marker_phrase.is_empty() || line.contains(marker_phrase);
    if !marked {
        return ParsedLine::Activity;
    }

    if let Some(idx) = line.find(MAGNITUDE_TOKEN) {
        return match parse_magnitude(&line[idx + MAGNITUDE_TOKEN.len()..]) {
            Some(magnitude) => ParsedLine::Event {
                magnitude,
                raw_timestamp: None,
            },
            None => ParsedLine::Malformed("unreadable magnitude"),
        };
    }

    if marker_phrase.is_empty() {
        return ParsedLine::Activity;
    }
    ParsedLine::Malformed("marker phrase without magnitude")
}

fn parse_magnitude_exact(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// `/dev/ttyACM*` and `/dev/ttyUSB*` nodes present right now.
pub fn candidate_ports() -> Vec<PathBuf> {
    candidate_ports_in(Path::new("/dev"))
}

fn candidate_ports_in(dir: &Path) -> Vec<PathBuf> {
    let mut ports: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("ttyACM") || name.starts_with("ttyUSB")
            })
            .map(|e| e.path())
            .collect(),
        Err(_) => Vec::new(),
    };
    ports.sort();
    ports
}

pub fn log_candidate_ports() {
    let ports = candidate_ports();
    if ports.is_empty() {
        warn!("link: no /dev/ttyACM* or /dev/ttyUSB* devices found");
        return;
    }
    warn!("link: candidate serial ports:");
    for port in ports {
        warn!("  {}", port.display());
    }
}

pub struct EventSource {
    reader: LineReader,
    port: String,
    marker_phrase: String,
    sequence: u64,
    closed: Option<String>,
}

impl EventSource {
    pub fn open(config: &LinkConfig) -> Result<Self, LinkError> {
        let (file, eof) = link::open_device(Path::new(&config.port)).map_err(|source| {
            LinkError::Unavailable {
                port: config.port.clone(),
                source,
            }
        })?;
        let source = Self::from_reader(file, &config.port, &config.marker_phrase, eof)?;
        info!("✓ Sensor link open on {}", config.port);
        Ok(source)
    }

    pub fn from_reader<R>(reader: R, port: &str, marker_phrase: &str, eof: EofPolicy) -> Result<Self, LinkError>
    where
        R: Read + Send + 'static,
    {
        let reader = link::spawn_line_reader(reader, "link", eof).map_err(|source| {
            LinkError::Unavailable {
                port: port.to_string(),
                source,
            }
        })?;
        Ok(Self {
            reader,
            port: port.to_string(),
            marker_phrase: marker_phrase.to_string(),
            sequence: 0,
            closed: None,
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    fn disconnected(&mut self, reason: String) -> LinkError {
        self.closed = Some(reason.clone());
        LinkError::Disconnected {
            port: self.port.clone(),
            reason,
        }
    }

    /// The next parsed event, `Ok(None)` when no complete line is waiting.
    /// Returns immediately in every case.
    pub fn next_event(&mut self) -> Result<Option<VibrationEvent>, LinkError> {
        if let Some(reason) = &self.closed {
            return Err(LinkError::Disconnected {
                port: self.port.clone(),
                reason: reason.clone(),
            });
        }

        loop {
            match self.reader.try_recv() {
                Ok(LinkMessage::Line(line)) => match parse_line(&line, &self.marker_phrase) {
                    ParsedLine::Event {
                        magnitude,
                        raw_timestamp,
                    } => {
                        self.sequence += 1;
                        let raw_timestamp = raw_timestamp
                            .unwrap_or_else(|| Local::now().format("%Y%m%d_%H%M%S").to_string());
                        debug!("link: event #{} magnitude {:.2}", self.sequence, magnitude);
                        return Ok(Some(VibrationEvent {
                            magnitude,
                            raw_timestamp,
                            sequence: self.sequence,
                        }));
                    }
                    ParsedLine::Malformed(reason) => {
                        warn!("link: ignoring sensor line ({}): {:?}", reason, line);
                    }
                    ParsedLine::Activity => debug!("link activity: {}", line),
                    ParsedLine::Empty => {}
                },
                Ok(LinkMessage::Closed(err)) => {
                    let reason = match err {
                        Some(e) => e.to_string(),
                        None => "end of stream".to_string(),
                    };
                    return Err(self.disconnected(reason));
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => {
                    return Err(self.disconnected("reader thread exited".to_string()));
                }
            }
        }
    }

    /// Stop the reader thread, which closes the device once its current
    /// read returns. Further polls report a disconnect.
    pub fn close(&mut self) {
        self.reader.stop();
        if self.closed.is_none() {
            self.closed = Some("closed".to_string());
            debug!("link: {} released", self.port);
        }
    }
}
