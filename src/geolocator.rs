// src/geolocator.rs
//
// Best-effort location fixes. GPS absence is a normal operating mode: every
// path out of `current_fix` is a `LocationFix`, possibly unavailable.

use crate::link::{self, LineReader, LinkMessage};
use crate::types::{GpsBackend, GpsConfig, LocationFix};
use chrono::Local;
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FixSourceError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
}

/// One raw reading from a fix source. Fields the receiver could not
/// determine are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FixSample {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
}

impl FixSample {
    /// Has a real latitude/longitude pair rather than a placeholder.
    pub fn is_valid(&self) -> bool {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => {
                lat.is_finite()
                    && lon.is_finite()
                    && (-90.0..=90.0).contains(&lat)
                    && (-180.0..=180.0).contains(&lon)
            }
            _ => false,
        }
    }

    fn into_fix(self) -> LocationFix {
        LocationFix {
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude.filter(|v| v.is_finite()),
            speed: self.speed.filter(|v| v.is_finite()),
            available: true,
            sampled_at: Local::now(),
        }
    }
}

/// A device or daemon that yields location samples.
pub trait FixSource: Send {
    fn name(&self) -> &str;

    /// Wait at most `timeout` for one sample. `Ok(None)` means nothing
    /// arrived in time.
    fn next_sample(&mut self, timeout: Duration) -> Result<Option<FixSample>, FixSourceError>;

    fn release(&mut self) {}
}

/// How hard one fix request may try: whichever limit runs out first.
#[derive(Debug, Clone, Copy)]
pub struct FixBudget {
    pub attempts: u32,
    pub duration: Duration,
    pub attempt_timeout: Duration,
}

impl FixBudget {
    pub fn from_config(config: &GpsConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            duration: Duration::from_millis(config.budget_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms.max(1)),
        }
    }
}

pub struct GeoLocator {
    source: Option<Box<dyn FixSource>>,
}

impl GeoLocator {
    pub fn new(source: Option<Box<dyn FixSource>>) -> Self {
        Self { source }
    }

    /// Build the configured backend. A backend that fails to start leaves
    /// the locator running without a source.
    pub fn from_config(config: &GpsConfig) -> Self {
        let source: Result<Option<Box<dyn FixSource>>, FixSourceError> = match config.backend {
            GpsBackend::Disabled => Ok(None),
            GpsBackend::Gpsd => GpsdSource::connect(&config.gpsd_address)
                .map(|s| Some(Box::new(s) as Box<dyn FixSource>)),
            GpsBackend::Nmea => NmeaSource::open(Path::new(&config.nmea_device))
                .map(|s| Some(Box::new(s) as Box<dyn FixSource>)),
        };

        match source {
            Ok(Some(source)) => {
                info!("✓ GPS ready ({})", source.name());
                Self::new(Some(source))
            }
            Ok(None) => {
                info!("GPS disabled, events will be logged without location");
                Self::new(None)
            }
            Err(e) => {
                warn!("gps: initialization failed ({:?}): {}", config.backend, e);
                warn!("gps: continuing without location");
                Self::new(None)
            }
        }
    }

    #[cfg(test)]
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// First valid sample within `budget`, or an unavailable fix. Never fails.
    pub fn current_fix(&mut self, budget: &FixBudget) -> LocationFix {
        let Some(source) = self.source.as_mut() else {
            return LocationFix::unavailable();
        };

        let started = Instant::now();
        let mut placeholders = 0u32;
        let mut failure: Option<FixSourceError> = None;

        for attempt in 1..=budget.attempts {
            let elapsed = started.elapsed();
            if elapsed >= budget.duration {
                break;
            }
            let timeout = budget.attempt_timeout.min(budget.duration - elapsed);

            match source.next_sample(timeout) {
                Ok(Some(sample)) if sample.is_valid() => {
                    debug!("gps: fix on attempt {}", attempt);
                    return sample.into_fix();
                }
                Ok(Some(_)) => placeholders += 1,
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            Some(e) => warn!("gps: {} read failed: {}", source.name(), e),
            None => warn!(
                "gps: no valid fix within budget ({} placeholder sample(s), {:.1}s)",
                placeholders,
                started.elapsed().as_secs_f64()
            ),
        }
        LocationFix::unavailable()
    }

    pub fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.release();
            debug!("gps: {} released", source.name());
        }
    }
}

// ============================================================================
// GPSD (JSON over TCP)
// ============================================================================

const GPSD_WATCH: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";
const GPSD_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct GpsdSource {
    address: String,
    reader: BufReader<TcpStream>,
    pending: String,
}

impl GpsdSource {
    pub fn connect(address: &str) -> Result<Self, FixSourceError> {
        let addr = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FixSourceError::Protocol(format!("cannot resolve {}", address)))?;
        let mut stream = TcpStream::connect_timeout(&addr, GPSD_CONNECT_TIMEOUT)?;
        stream.write_all(GPSD_WATCH)?;
        Ok(Self {
            address: address.to_string(),
            reader: BufReader::new(stream),
            pending: String::new(),
        })
    }
}

/// A TPV report as a sample. Reports without a 2D fix carry no position.
pub fn parse_tpv(line: &str) -> Option<FixSample> {
    let report: Value = serde_json::from_str(line).ok()?;
    if report.get("class").and_then(Value::as_str) != Some("TPV") {
        return None;
    }

    let mode = report.get("mode").and_then(Value::as_i64).unwrap_or(0);
    let field = |key: &str| report.get(key).and_then(Value::as_f64);
    let has_fix = mode >= 2;

    Some(FixSample {
        latitude: field("lat").filter(|_| has_fix),
        longitude: field("lon").filter(|_| has_fix),
        altitude: field("altMSL").or_else(|| field("alt")),
        speed: field("speed"),
    })
}

impl FixSource for GpsdSource {
    fn name(&self) -> &str {
        &self.address
    }

    fn next_sample(&mut self, timeout: Duration) -> Result<Option<FixSample>, FixSourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.reader.get_ref().set_read_timeout(Some(remaining))?;

            match self.reader.read_line(&mut self.pending) {
                Ok(0) => {
                    return Err(FixSourceError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "gpsd closed the connection",
                    )))
                }
                Ok(_) => {
                    if !self.pending.ends_with('\n') {
                        continue;
                    }
                    let line = std::mem::take(&mut self.pending);
                    if let Some(sample) = parse_tpv(line.trim()) {
                        return Ok(Some(sample));
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn release(&mut self) {
        let _ = self
            .reader
            .get_mut()
            .write_all(b"?WATCH={\"enable\":false};\n");
    }
}

// ============================================================================
// NMEA (GGA sentences on a serial device)
// ============================================================================

pub struct NmeaSource {
    device: String,
    reader: LineReader,
}

impl NmeaSource {
    pub fn open(path: &Path) -> Result<Self, FixSourceError> {
        let (file, eof) = link::open_device(path)?;
        let reader = link::spawn_line_reader(file, "nmea", eof)?;
        Ok(Self {
            device: path.display().to_string(),
            reader,
        })
    }

    #[cfg(test)]
    fn from_reader(device: &str, reader: LineReader) -> Self {
        Self {
            device: device.to_string(),
            reader,
        }
    }
}

fn nmea_checksum_ok(sentence: &str) -> bool {
    let Some(body) = sentence.strip_prefix('$') else {
        return false;
    };
    match body.split_once('*') {
        Some((payload, checksum)) => {
            let computed = payload.bytes().fold(0u8, |acc, b| acc ^ b);
            u8::from_str_radix(checksum.trim(), 16).map_or(false, |c| c == computed)
        }
        // Checksum is optional in NMEA 0183.
        None => true,
    }
}

/// `ddmm.mmmm` (or `dddmm.mmmm`) plus hemisphere into signed decimal degrees.
fn nmea_coordinate(value: &str, hemisphere: &str) -> Option<f64> {
    let raw: f64 = value.trim().parse().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    match hemisphere.trim() {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

/// A GGA sentence as a sample; `None` for other sentences or a bad checksum.
/// Fix quality 0 yields a sample without position.
pub fn parse_gga(sentence: &str) -> Option<FixSample> {
    let sentence = sentence.trim();
    if !nmea_checksum_ok(sentence) {
        return None;
    }
    let payload = sentence
        .trim_start_matches('$')
        .split('*')
        .next()
        .unwrap_or_default();
    let fields: Vec<&str> = payload.split(',').collect();
    if fields.len() < 10 || fields[0].len() < 5 || !fields[0].ends_with("GGA") {
        return None;
    }

    let quality: u32 = fields[6].trim().parse().unwrap_or(0);
    if quality == 0 {
        return Some(FixSample::default());
    }

    Some(FixSample {
        latitude: nmea_coordinate(fields[2], fields[3]),
        longitude: nmea_coordinate(fields[4], fields[5]),
        altitude: fields[9].trim().parse().ok(),
        speed: None,
    })
}

impl FixSource for NmeaSource {
    fn name(&self) -> &str {
        &self.device
    }

    fn next_sample(&mut self, timeout: Duration) -> Result<Option<FixSample>, FixSourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.reader.recv_timeout(remaining) {
                Ok(LinkMessage::Line(line)) => {
                    if let Some(sample) = parse_gga(&line) {
                        return Ok(Some(sample));
                    }
                }
                Ok(LinkMessage::Closed(Some(e))) => return Err(e.into()),
                Ok(LinkMessage::Closed(None)) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(FixSourceError::Protocol(format!(
                        "{} stopped producing sentences",
                        self.device
                    )))
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
            }
        }
    }

    fn release(&mut self) {
        self.reader.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::EofPolicy;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct ScriptedSource {
        script: VecDeque<Result<Option<FixSample>, FixSourceError>>,
        calls: Arc<AtomicU32>,
    }

    impl FixSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn next_sample(&mut self, _timeout: Duration) -> Result<Option<FixSample>, FixSourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.pop_front().unwrap_or(Ok(None))
        }
    }

    fn scripted(
        script: Vec<Result<Option<FixSample>, FixSourceError>>,
    ) -> (GeoLocator, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let source = ScriptedSource {
            script: script.into(),
            calls: calls.clone(),
        };
        (GeoLocator::new(Some(Box::new(source))), calls)
    }

    fn budget(attempts: u32) -> FixBudget {
        FixBudget {
            attempts,
            duration: Duration::from_secs(5),
            attempt_timeout: Duration::from_millis(10),
        }
    }

    fn sample(lat: f64, lon: f64) -> FixSample {
        FixSample {
            latitude: Some(lat),
            longitude: Some(lon),
            ..Default::default()
        }
    }

    #[test]
    fn test_always_timing_out_source_is_unavailable() {
        let (mut locator, calls) = scripted(Vec::new());
        let fix = locator.current_fix(&budget(4));
        assert!(!fix.available);
        assert_eq!(fix.latitude, None);
        assert_eq!(fix.longitude, None);
        assert_eq!(fix.altitude, None);
        assert_eq!(fix.speed, None);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_skips_placeholders_until_valid() {
        let (mut locator, calls) = scripted(vec![
            Ok(Some(FixSample::default())),
            Ok(None),
            Ok(Some(FixSample {
                altitude: Some(12.0),
                ..sample(48.1173, 11.5167)
            })),
            Ok(Some(sample(1.0, 1.0))),
        ]);
        let fix = locator.current_fix(&budget(10));
        assert!(fix.is_available());
        assert_eq!(fix.latitude, Some(48.1173));
        assert_eq!(fix.altitude, Some(12.0));
        assert_eq!(fix.speed, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_source_error_is_absorbed() {
        let (mut locator, _) = scripted(vec![Err(FixSourceError::Protocol("boom".into()))]);
        let fix = locator.current_fix(&budget(3));
        assert!(!fix.available);
    }

    #[test]
    fn test_zero_duration_budget_never_polls() {
        let (mut locator, calls) = scripted(vec![Ok(Some(sample(1.0, 2.0)))]);
        let fix = locator.current_fix(&FixBudget {
            attempts: 5,
            duration: Duration::ZERO,
            attempt_timeout: Duration::from_millis(10),
        });
        assert!(!fix.available);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_source_and_release() {
        let mut locator = GeoLocator::new(None);
        assert!(!locator.current_fix(&budget(3)).available);

        let (mut locator, _) = scripted(Vec::new());
        locator.release();
        assert!(!locator.has_source());
        assert!(!locator.current_fix(&budget(3)).available);
    }

    #[test]
    fn test_out_of_range_is_placeholder() {
        assert!(!sample(91.0, 0.0).is_valid());
        assert!(!sample(f64::NAN, 0.0).is_valid());
        assert!(sample(-33.9, 151.2).is_valid());
    }

    #[test]
    fn test_parse_gga() {
        let s = parse_gga("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47").unwrap();
        assert!((s.latitude.unwrap() - 48.1173).abs() < 1e-4);
        assert!((s.longitude.unwrap() - 11.516_666).abs() < 1e-4);
        assert_eq!(s.altitude, Some(545.4));
        assert_eq!(s.speed, None);

        let south_west = parse_gga("$GNGGA,0,3352.000,S,15112.000,W,1,05,1.0,,M,,M,,").unwrap();
        assert!(south_west.latitude.unwrap() < 0.0);
        assert!(south_west.longitude.unwrap() < 0.0);
        assert_eq!(south_west.altitude, None);
    }

    #[test]
    fn test_parse_gga_rejects() {
        // Bad checksum.
        assert!(parse_gga("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00").is_none());
        // Other sentence type.
        assert!(parse_gga("$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W").is_none());
        // No fix: sample without position.
        let no_fix = parse_gga("$GPGGA,123519,,,,,0,00,,,M,,M,,").unwrap();
        assert!(!no_fix.is_valid());
    }

    #[test]
    fn test_nmea_source_reads_gga_lines() {
        let data = "$GPGSV,3,1,11\n$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\n";
        let reader = link::spawn_line_reader(Cursor::new(data.as_bytes().to_vec()), "nmea", EofPolicy::Disconnect)
            .unwrap();
        let mut source = NmeaSource::from_reader("test", reader);
        let first = source.next_sample(Duration::from_secs(5)).unwrap().unwrap();
        assert!(first.is_valid());
        assert!(source.next_sample(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_nmea_release_stops_idle_reader() {
        let reader = link::spawn_line_reader(std::io::empty(), "nmea", EofPolicy::Retry).unwrap();
        let mut source = NmeaSource::from_reader("idle", reader);
        assert!(matches!(source.next_sample(Duration::from_millis(30)), Ok(None)));

        source.release();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !source.reader.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(source.reader.is_finished());
    }

    #[test]
    fn test_parse_tpv() {
        let s = parse_tpv(r#"{"class":"TPV","mode":3,"lat":52.5,"lon":13.4,"altMSL":34.0,"speed":8.25}"#)
            .unwrap();
        assert_eq!(s, FixSample {
            latitude: Some(52.5),
            longitude: Some(13.4),
            altitude: Some(34.0),
            speed: Some(8.25),
        });

        let no_fix = parse_tpv(r#"{"class":"TPV","mode":1}"#).unwrap();
        assert!(!no_fix.is_valid());
        assert!(parse_tpv(r#"{"class":"SKY"}"#).is_none());
        assert!(parse_tpv("not json").is_none());
    }

    #[test]
    fn test_gpsd_source_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut watch = String::new();
            BufReader::new(stream.try_clone().unwrap())
                .read_line(&mut watch)
                .unwrap();
            assert!(watch.starts_with("?WATCH"));
            stream
                .write_all(
                    b"{\"class\":\"VERSION\"}\n{\"class\":\"TPV\",\"mode\":1}\n{\"class\":\"TPV\",\"mode\":2,\"lat\":10.5,\"lon\":-20.25}\n",
                )
                .unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });

        let source = GpsdSource::connect(&address).unwrap();
        let mut locator = GeoLocator::new(Some(Box::new(source)));
        let fix = locator.current_fix(&FixBudget {
            attempts: 5,
            duration: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(2),
        });
        assert!(fix.is_available());
        assert_eq!(fix.latitude, Some(10.5));
        assert_eq!(fix.longitude, Some(-20.25));
        assert_eq!(fix.altitude, None);
        locator.release();
        server.join().unwrap();
    }

    #[test]
    fn test_unreachable_gpsd_falls_back_to_no_source() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let locator = GeoLocator::from_config(&GpsConfig {
            gpsd_address: address,
            ..Default::default()
        });
        assert!(!locator.has_source());
    }
}
