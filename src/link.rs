// src/link.rs
//
// Background line reader for newline-framed text links (sensor MCU, NMEA
// receiver). A dedicated thread owns the blocking reads and hands complete
// lines over a channel, so consumers can poll without ever blocking.
// Stopping the handle ends the thread at its next read boundary, which
// drops the reader and closes the device.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Pause before re-reading a character device that returned no data.
const EOF_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum LinkMessage {
    Line(String),
    /// The reader is gone: `None` for end of stream, `Some` for a read error.
    Closed(Option<io::Error>),
}

/// What a zero-length read means for this link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofPolicy {
    /// Plain streams: end of data is end of link.
    Disconnect,
    /// TTYs configured with a read timeout return 0 bytes when idle.
    Retry,
}

/// Malformed UTF-8 is treated as an empty line.
pub fn decode_line(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.trim().to_string(),
        Err(_) => String::new(),
    }
}

#[cfg(unix)]
fn is_char_device(file: &File) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file.metadata()
        .map(|m| m.file_type().is_char_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_char_device(_file: &File) -> bool {
    false
}

/// Open a device node or file for line reading, choosing the EOF policy
/// from what the path turns out to be.
pub fn open_device(path: &Path) -> io::Result<(File, EofPolicy)> {
    let file = File::open(path)?;
    let policy = if is_char_device(&file) {
        EofPolicy::Retry
    } else {
        EofPolicy::Disconnect
    };
    Ok((file, policy))
}

/// Handle on a running reader thread.
pub struct LineReader {
    rx: Receiver<LinkMessage>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl LineReader {
    pub fn try_recv(&self) -> Result<LinkMessage, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<LinkMessage, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Ask the thread to exit. Returns immediately; a read already in
    /// progress finishes first.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the reader thread. It exits on end of stream, on a read error,
/// once the receiving side is gone, or when stopped.
pub fn spawn_line_reader<R>(reader: R, name: &str, eof: EofPolicy) -> io::Result<LineReader>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let stopped = Arc::clone(&stop);
    let thread_name = format!("{}-reader", name);

    let handle = thread::Builder::new().name(thread_name).spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            if stopped.load(Ordering::SeqCst) {
                debug!("link reader stopped");
                return;
            }
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    if eof == EofPolicy::Retry {
                        thread::sleep(EOF_BACKOFF);
                        continue;
                    }
                    if !buf.is_empty() {
                        let _ = tx.send(LinkMessage::Line(decode_line(&buf)));
                    }
                    let _ = tx.send(LinkMessage::Closed(None));
                    return;
                }
                Ok(_) => {
                    // A timed-out TTY read can hand back half a line.
                    if !buf.ends_with(b"\n") && eof == EofPolicy::Retry {
                        continue;
                    }
                    let line = decode_line(&buf);
                    buf.clear();
                    if tx.send(LinkMessage::Line(line)).is_err() {
                        debug!("link consumer gone, reader exiting");
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
                {
                    thread::sleep(EOF_BACKOFF);
                }
                Err(e) => {
                    let _ = tx.send(LinkMessage::Closed(Some(e)));
                    return;
                }
            }
        }
    })?;

    Ok(LineReader { rx, stop, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn collect(rx: &LineReader) -> (Vec<String>, bool) {
        let mut lines = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(LinkMessage::Line(l)) => lines.push(l),
                Ok(LinkMessage::Closed(err)) => return (lines, err.is_none()),
                Err(_) => return (lines, false),
            }
        }
    }

    #[test]
    fn test_lines_then_clean_close() {
        let data = b"EVENT,1.0,a\r\nhello\nlast-without-newline".to_vec();
        let rx = spawn_line_reader(Cursor::new(data), "test", EofPolicy::Disconnect).unwrap();
        let (lines, clean) = collect(&rx);
        assert_eq!(lines, vec!["EVENT,1.0,a", "hello", "last-without-newline"]);
        assert!(clean);
    }

    #[test]
    fn test_invalid_utf8_becomes_empty_line() {
        let data = vec![0xff, 0xfe, b'\n', b'o', b'k', b'\n'];
        let rx = spawn_line_reader(Cursor::new(data), "test", EofPolicy::Disconnect).unwrap();
        let (lines, _) = collect(&rx);
        assert_eq!(lines, vec!["".to_string(), "ok".to_string()]);
    }

    #[test]
    fn test_open_regular_file_disconnects_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.log");
        std::fs::write(&path, "x\n").unwrap();
        let (_, policy) = open_device(&path).unwrap();
        assert_eq!(policy, EofPolicy::Disconnect);
        assert!(open_device(&dir.path().join("missing")).is_err());
    }

    /// Never-ending idle device: every read returns no data.
    struct IdleDevice {
        dropped: Arc<AtomicBool>,
    }

    impl Read for IdleDevice {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Drop for IdleDevice {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn wait_until(deadline: Duration, done: impl Fn() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_stop_ends_idle_reader_and_drops_device() {
        let dropped = Arc::new(AtomicBool::new(false));
        let device = IdleDevice {
            dropped: Arc::clone(&dropped),
        };
        let reader = spawn_line_reader(device, "idle", EofPolicy::Retry).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(!reader.is_finished());

        reader.stop();
        assert!(wait_until(Duration::from_secs(2), || reader.is_finished()));
        assert!(dropped.load(Ordering::SeqCst));
        assert!(matches!(reader.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_dropping_handle_stops_reader() {
        let dropped = Arc::new(AtomicBool::new(false));
        let device = IdleDevice {
            dropped: Arc::clone(&dropped),
        };
        drop(spawn_line_reader(device, "idle", EofPolicy::Retry).unwrap());
        assert!(wait_until(Duration::from_secs(2), || dropped.load(Ordering::SeqCst)));
    }
}
