//! Serial traffic capture.
//!
//! Every byte crossing the transport boundary is timestamped, rendered as a
//! bit string and buffered, then flushed in batches to a gzip-compressed
//! delimited text file for later audit. [`CaptureTransport`] does the
//! interception; callers see an unchanged [`Transport`].

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::transport::Transport;

/// Timestamp layout of individual capture records.
pub const RECORD_TIME_FMT: &str = "%Y_%m_%d_%H_%M_%S_%6f";
/// Timestamp layout used to name capture files.
pub const FILENAME_TIME_FMT: &str = "%Y_%m_%d_%H_%M_%S";

/// Errors from capture bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The wrapped transport was already released (or never installed).
    #[error("no captured transport to release")]
    NoCapture,
}

/// Which way the bytes travelled across the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read back from the bridge.
    Rx,
    /// Bytes written towards the bridge.
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

/// One audit record: when, which way, and the raw bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    /// Capture time, microsecond precision, [`RECORD_TIME_FMT`] layout.
    pub timestamp: String,
    /// Transfer direction.
    pub direction: Direction,
    /// MSB-first bit string of the transferred bytes.
    pub bits: String,
}

enum Sink {
    Gzip(GzEncoder<File>),
    Writer(Box<dyn Write + Send>),
    Closed,
}

fn write_events<W: Write + ?Sized>(sink: &mut W, events: &[CapturedEvent]) -> io::Result<()> {
    for event in events {
        writeln!(sink, "{}, {}, {}", event.timestamp, event.direction, event.bits)?;
    }
    Ok(())
}

/// Append-only buffer of captured events with batched durable flushes.
pub struct CaptureLog {
    buffer: Vec<CapturedEvent>,
    max_buffer_len: usize,
    sink: Sink,
}

impl CaptureLog {
    /// Records buffered before an automatic flush.
    pub const DEFAULT_BUFFER_LEN: usize = 10_000;

    /// Captures into a gzip-compressed file at `path`.
    pub fn gzip_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::with_sink(Sink::Gzip(GzEncoder::new(
            file,
            Compression::default(),
        ))))
    }

    /// Captures into an arbitrary writer, uncompressed.
    pub fn with_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self::with_sink(Sink::Writer(Box::new(writer)))
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_len: Self::DEFAULT_BUFFER_LEN,
            sink,
        }
    }

    /// Overrides the automatic flush threshold.
    pub fn with_max_buffer_len(mut self, max_buffer_len: usize) -> Self {
        self.max_buffer_len = max_buffer_len;
        self
    }

    /// Suggested capture file name, e.g. `2026_08_24_13_40_02.csv.gz`.
    pub fn default_filename() -> String {
        format!("{}.csv.gz", chrono::Local::now().format(FILENAME_TIME_FMT))
    }

    /// Appends one event, flushing if the buffer has grown past its limit.
    pub fn record(&mut self, direction: Direction, bytes: &[u8]) -> io::Result<()> {
        let bits: String = bytes.iter().map(|byte| format!("{:08b}", byte)).collect();
        self.buffer.push(CapturedEvent {
            timestamp: chrono::Local::now().format(RECORD_TIME_FMT).to_string(),
            direction,
            bits,
        });
        if self.buffer.len() > self.max_buffer_len {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes the whole buffer to the sink and clears it.
    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            Sink::Gzip(encoder) => write_events(encoder, &self.buffer)?,
            Sink::Writer(writer) => write_events(writer, &self.buffer)?,
            Sink::Closed => {}
        }
        self.buffer.clear();
        Ok(())
    }

    /// Flushes the remainder and finishes the sink. Safe to call twice.
    pub fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        match std::mem::replace(&mut self.sink, Sink::Closed) {
            Sink::Gzip(encoder) => {
                encoder.finish()?;
            }
            Sink::Writer(mut writer) => writer.flush()?,
            Sink::Closed => {}
        }
        Ok(())
    }
}

impl Drop for CaptureLog {
    // Last-resort flush so no exit path loses buffered records.
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A [`Transport`] wrapper that records all traffic into a [`CaptureLog`].
pub struct CaptureTransport<T> {
    inner: Option<T>,
    log: CaptureLog,
}

impl<T: Transport> CaptureTransport<T> {
    /// Wraps `inner`, recording its traffic into `log`.
    pub fn new(inner: T, log: CaptureLog) -> Self {
        Self {
            inner: Some(inner),
            log,
        }
    }

    /// Hands the unwrapped transport back. Fails once already released.
    pub fn release(&mut self) -> Result<T, CaptureError> {
        self.inner.take().ok_or(CaptureError::NoCapture)
    }

    /// The capture log behind this transport.
    pub fn log_mut(&mut self) -> &mut CaptureLog {
        &mut self.log
    }
}

impl<T: Transport> Transport for CaptureTransport<T> {
    fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, CaptureError::NoCapture))?;
        let bytes = inner.read(n)?;
        self.log.record(Direction::Rx, &bytes)?;
        Ok(bytes)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, CaptureError::NoCapture))?;
        self.log.record(Direction::Tx, bytes)?;
        inner.write(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimChip;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn records_render_msb_first_bit_strings() {
        let mut log = CaptureLog::with_writer(io::sink());
        log.record(Direction::Tx, &[0x10, 0x05]).unwrap();
        assert_eq!(log.buffer[0].bits, "0001000000000101");
        assert_eq!(log.buffer[0].direction, Direction::Tx);
    }

    #[test]
    fn gzip_flush_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.csv.gz");
        {
            let mut log = CaptureLog::gzip_file(&path).unwrap();
            log.record(Direction::Tx, &[0xAA]).unwrap();
            log.record(Direction::Rx, &[0x00, 0xFF]).unwrap();
            log.close().unwrap();
        }
        let mut text = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("TX, 10101010"), "line was {:?}", lines[0]);
        assert!(lines[1].ends_with("RX, 0000000011111111"));
    }

    #[test]
    fn buffer_overflow_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.csv.gz");
        let mut log = CaptureLog::gzip_file(&path).unwrap().with_max_buffer_len(2);
        for _ in 0..3 {
            log.record(Direction::Tx, &[0x00]).unwrap();
        }
        // Three records against a limit of two: the buffer flushed once.
        assert!(log.buffer.is_empty());
    }

    #[test]
    fn capture_transport_records_both_directions() {
        let log = CaptureLog::with_writer(io::sink());
        let mut transport = CaptureTransport::new(SimChip::new(), log);
        transport.write(&[0x40, 0x00]).unwrap();
        let response = transport.read(2).unwrap();
        assert_eq!(response.len(), 2);
        let events = &transport.log.buffer;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].direction, Direction::Tx);
        assert_eq!(events[0].bits, "0100000000000000");
        assert_eq!(events[1].direction, Direction::Rx);
    }

    #[test]
    fn release_is_one_shot() {
        let log = CaptureLog::with_writer(io::sink());
        let mut transport = CaptureTransport::new(SimChip::new(), log);
        assert!(transport.release().is_ok());
        assert!(matches!(transport.release(), Err(CaptureError::NoCapture)));
        assert!(transport.read(2).is_err());
    }
}
