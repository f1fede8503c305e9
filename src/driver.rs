//! Chip driver and host-side memory model.
//!
//! [`SramDriver`] issues protocol commands over a captured transport and
//! maintains a shadow of the chip state: one optional value per cell, the
//! currently addressed cell, and the clock/delay registers. `None` always
//! means "not confirmed by a successful read". Writes update the shadow
//! optimistically; a later read that disagrees shows up as a test fault.

use std::collections::BTreeMap;
use std::io;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::capture::{CaptureError, CaptureLog, CaptureTransport};
use crate::codec::{self, Command, CodecError, ADDR_COUNT};
use crate::transport::Transport;

/// Errors detected while building a driver session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The supplied initial memory map addresses a cell outside the array.
    #[error("initial memory map addresses cell {0}, outside [0, {ADDR_COUNT})")]
    AddressOutOfRange(u16),
}

/// Errors surfaced by driver primitives and the test orchestration.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Transport-level failure (a short read is not one of these).
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// Command could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Capture bookkeeping failure.
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    /// The chip's clock readback disagrees with the requested factor.
    /// Fatal: timing-dependent results taken afterwards would be invalid.
    #[error("clock factor readback {observed:?} does not match requested {requested}")]
    ClockMismatch {
        /// Factor the scan asked for.
        requested: u8,
        /// Factor the chip reported, if the readback succeeded at all.
        observed: Option<u8>,
    },
}

/// Construction-time settings for one driver session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Prior knowledge of cell contents; unlisted cells start unknown.
    pub initial_memory: Option<BTreeMap<u16, u8>>,
    /// Assumed clock divisor at session start (25 = 1.00 MHz).
    pub clk_factor: u8,
    /// Assumed read sampling delay at session start.
    pub delay_factor: u8,
    /// Minimum wait between any two commands.
    pub settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_memory: None,
            clk_factor: 25,
            delay_factor: 0,
            settle: Duration::from_millis(1),
        }
    }
}

/// Effective chip frequency in MHz for a clock divisor.
pub fn clk_mhz(clk_factor: u8) -> f64 {
    100.0 / (4.0 * clk_factor as f64)
}

/// Driver for one SRAM test-chip session.
pub struct SramDriver<T: Transport> {
    io: CaptureTransport<T>,
    memory: Vec<Option<u8>>,
    curr_addr: Option<u16>,
    clk_factor: Option<u8>,
    delay_factor: Option<u8>,
    settle: Duration,
}

impl<T: Transport> SramDriver<T> {
    /// Builds a session over `transport`, capturing traffic into `capture`.
    pub fn new(transport: T, capture: CaptureLog, config: SessionConfig) -> Result<Self, ConfigError> {
        let mut memory = vec![None; ADDR_COUNT as usize];
        if let Some(initial) = &config.initial_memory {
            for (&addr, &value) in initial {
                if addr >= ADDR_COUNT {
                    return Err(ConfigError::AddressOutOfRange(addr));
                }
                memory[addr as usize] = Some(value);
            }
        }
        Ok(Self {
            io: CaptureTransport::new(transport, capture),
            memory,
            curr_addr: Some(0),
            clk_factor: Some(config.clk_factor),
            delay_factor: Some(config.delay_factor),
            settle: config.settle,
        })
    }

    /// Shadow of the full array; `None` cells are unknown.
    pub fn memory(&self) -> &[Option<u8>] {
        &self.memory
    }

    /// Shadow value of one cell, unknown when out of range too.
    pub fn cell(&self, addr: u16) -> Option<u8> {
        self.memory.get(addr as usize).copied().flatten()
    }

    /// The cell the chip is currently addressing, as far as the host knows.
    pub fn curr_addr(&self) -> Option<u16> {
        self.curr_addr
    }

    /// Last commanded or read-back clock divisor.
    pub fn clk_factor(&self) -> Option<u8> {
        self.clk_factor
    }

    /// Last commanded read sampling delay.
    pub fn delay_factor(&self) -> Option<u8> {
        self.delay_factor
    }

    /// Selects the cell for subsequent value operations.
    pub fn set_addr(&mut self, addr: u16) -> Result<(), DriverError> {
        self.io.write(&codec::encode(Command::SetAddress(addr))?)?;
        self.wait_settle();
        self.curr_addr = Some(addr);
        Ok(())
    }

    /// Writes a value to the current cell, optimistically updating the shadow.
    pub fn write_value(&mut self, value: u8) -> Result<(), DriverError> {
        self.io.write(&codec::encode(Command::WriteValue(value))?)?;
        self.wait_settle();
        match self.curr_addr {
            Some(addr) => self.store_shadow(addr, Some(value)),
            None => warn!("write with unknown current address, shadow not updated"),
        }
        Ok(())
    }

    /// Reads the bridge's address register back.
    ///
    /// A malformed response degrades the current address to unknown and
    /// returns `None`; it is never retried.
    pub fn read_addr(&mut self) -> Result<Option<u16>, DriverError> {
        self.io.write(&codec::encode(Command::ReadAddress)?)?;
        self.wait_settle();
        let response = self.io.read(2)?;
        if response.len() != 2 {
            warn!("rx {} bytes, expected 2", response.len());
            self.curr_addr = None;
            return Ok(None);
        }
        self.curr_addr = Some(codec::decode_address(&response)?);
        Ok(self.curr_addr)
    }

    /// Reads the current cell, recording the result in the shadow.
    ///
    /// A malformed response degrades the cell to unknown and returns `None`.
    pub fn read_value(&mut self) -> Result<Option<u8>, DriverError> {
        self.io.write(&codec::encode(Command::ReadValue)?)?;
        self.wait_settle();
        let response = self.io.read(2)?;
        if response.len() != 2 {
            warn!("rx {} bytes, expected 2", response.len());
            if let Some(addr) = self.curr_addr {
                self.store_shadow(addr, None);
            }
            return Ok(None);
        }
        let value = codec::decode_word(&response)?;
        match self.curr_addr {
            Some(addr) => self.store_shadow(addr, Some(value)),
            None => warn!("read with unknown current address, shadow not updated"),
        }
        Ok(Some(value))
    }

    /// Sets the chip clock divisor (100 MHz / (4 * factor)).
    pub fn set_clk(&mut self, clk_factor: u8) -> Result<(), DriverError> {
        self.io.write(&codec::encode(Command::SetClock(clk_factor))?)?;
        self.wait_settle();
        self.clk_factor = Some(clk_factor);
        Ok(())
    }

    /// Reads the clock divisor back; a malformed response degrades it.
    pub fn read_clk(&mut self) -> Result<Option<u8>, DriverError> {
        self.io.write(&codec::encode(Command::ReadClock)?)?;
        self.wait_settle();
        let response = self.io.read(2)?;
        if response.len() != 2 {
            warn!("rx {} bytes, expected 2", response.len());
            self.clk_factor = None;
            return Ok(None);
        }
        self.clk_factor = Some(codec::decode_word(&response)?);
        Ok(self.clk_factor)
    }

    /// Sets the read sampling delay in base-clock ticks after chip-enable.
    pub fn set_delay(&mut self, delay_factor: u8) -> Result<(), DriverError> {
        self.io.write(&codec::encode(Command::SetDelay(delay_factor))?)?;
        self.wait_settle();
        self.delay_factor = Some(delay_factor);
        Ok(())
    }

    /// Forces buffered capture records out to durable storage.
    pub fn flush_capture(&mut self) -> io::Result<()> {
        self.io.log_mut().flush()
    }

    /// Flushes and finishes the capture sink.
    pub fn close_capture(&mut self) -> io::Result<()> {
        self.io.log_mut().close()
    }

    /// Unwraps the raw transport, ending capture for good.
    pub fn release_io(&mut self) -> Result<T, CaptureError> {
        self.io.release()
    }

    fn store_shadow(&mut self, addr: u16, value: Option<u8>) {
        match self.memory.get_mut(addr as usize) {
            Some(cell) => *cell = value,
            // The bridge reported an address outside the array; there is
            // no cell to shadow it with.
            None => warn!("address {addr} outside array, shadow not updated"),
        }
    }

    fn wait_settle(&self) {
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimChip;

    fn bench_driver(chip: SimChip) -> SramDriver<SimChip> {
        let config = SessionConfig {
            settle: Duration::ZERO,
            ..SessionConfig::default()
        };
        SramDriver::new(chip, CaptureLog::with_writer(io::sink()), config).unwrap()
    }

    #[test]
    fn session_starts_fully_unknown() {
        let driver = bench_driver(SimChip::new());
        assert_eq!(driver.memory().len(), ADDR_COUNT as usize);
        assert!(driver.memory().iter().all(Option::is_none));
        assert_eq!(driver.curr_addr(), Some(0));
        assert_eq!(driver.clk_factor(), Some(25));
        assert_eq!(driver.delay_factor(), Some(0));
    }

    #[test]
    fn initial_memory_map_seeds_shadow() {
        let mut initial = BTreeMap::new();
        initial.insert(7u16, 0x42u8);
        let config = SessionConfig {
            initial_memory: Some(initial),
            settle: Duration::ZERO,
            ..SessionConfig::default()
        };
        let driver =
            SramDriver::new(SimChip::new(), CaptureLog::with_writer(io::sink()), config).unwrap();
        assert_eq!(driver.cell(7), Some(0x42));
        assert_eq!(driver.cell(8), None);
    }

    #[test]
    fn initial_memory_map_rejects_out_of_range_cell() {
        let mut initial = BTreeMap::new();
        initial.insert(512u16, 0u8);
        let config = SessionConfig {
            initial_memory: Some(initial),
            settle: Duration::ZERO,
            ..SessionConfig::default()
        };
        let result = SramDriver::new(SimChip::new(), CaptureLog::with_writer(io::sink()), config);
        assert!(matches!(result, Err(ConfigError::AddressOutOfRange(512))));
    }

    #[test]
    fn writes_update_shadow_optimistically() {
        let mut driver = bench_driver(SimChip::new());
        driver.set_addr(3).unwrap();
        driver.write_value(9).unwrap();
        // No read happened, the shadow already assumes success.
        assert_eq!(driver.cell(3), Some(9));
    }

    #[test]
    fn read_value_confirms_written_value() {
        let mut driver = bench_driver(SimChip::new());
        driver.set_addr(100).unwrap();
        driver.write_value(0xA5).unwrap();
        assert_eq!(driver.read_value().unwrap(), Some(0xA5));
        assert_eq!(driver.cell(100), Some(0xA5));
    }

    #[test]
    fn read_addr_reflects_selected_address() {
        let mut driver = bench_driver(SimChip::new());
        driver.set_addr(300).unwrap();
        assert_eq!(driver.read_addr().unwrap(), Some(300));
    }

    #[test]
    fn malformed_address_response_degrades_to_unknown() {
        let mut chip = SimChip::new();
        chip.truncate_next_responses(1);
        let mut driver = bench_driver(chip);
        driver.set_addr(12).unwrap();
        assert_eq!(driver.read_addr().unwrap(), None);
        assert_eq!(driver.curr_addr(), None);
        // The next complete readback recovers the state.
        assert_eq!(driver.read_addr().unwrap(), Some(12));
    }

    #[test]
    fn malformed_value_response_degrades_cell() {
        let mut chip = SimChip::new();
        chip.truncate_next_responses(1);
        let mut driver = bench_driver(chip);
        driver.set_addr(5).unwrap();
        driver.write_value(0x11).unwrap();
        assert_eq!(driver.read_value().unwrap(), None);
        assert_eq!(driver.cell(5), None);
    }

    #[test]
    fn malformed_clock_response_degrades_clock() {
        let mut chip = SimChip::new();
        chip.truncate_next_responses(1);
        let mut driver = bench_driver(chip);
        driver.set_clk(10).unwrap();
        assert_eq!(driver.read_clk().unwrap(), None);
        assert_eq!(driver.clk_factor(), None);
    }

    #[test]
    fn write_with_unknown_address_keeps_shadow_intact() {
        let mut chip = SimChip::new();
        chip.truncate_next_responses(1);
        let mut driver = bench_driver(chip);
        driver.read_addr().unwrap();
        assert_eq!(driver.curr_addr(), None);
        driver.write_value(0x33).unwrap();
        assert!(driver.memory().iter().all(Option::is_none));
    }

    #[test]
    fn set_delay_updates_shadow_and_chip() {
        let mut driver = bench_driver(SimChip::new());
        driver.set_delay(4).unwrap();
        assert_eq!(driver.delay_factor(), Some(4));
        let chip = driver.release_io().unwrap();
        assert_eq!(chip.delay_factor(), 4);
    }

    #[test]
    fn clk_mhz_matches_divisor_table() {
        assert_eq!(clk_mhz(1), 25.0);
        assert_eq!(clk_mhz(25), 1.0);
        assert_eq!(clk_mhz(10), 2.5);
    }
}
