//! Byte transports connecting the driver to the FPGA bridge.
//!
//! The driver only ever needs blocking `read`/`write`; anything satisfying
//! [`Transport`] can sit on the other end, whether a real serial port or the
//! in-memory [`SimChip`] used for bench-free runs and tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::codec::ADDR_COUNT;

/// Blocking byte-oriented transport boundary.
///
/// `read` blocks until `n` bytes are available and returns fewer only on
/// timeout or EOF; short reads are data, not errors. Hard I/O failures
/// surface as `Err`.
pub trait Transport {
    /// Reads up to `n` bytes.
    fn read(&mut self, n: usize) -> io::Result<Vec<u8>>;
    /// Writes all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Adapter exposing a serial port as a [`Transport`].
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    /// Default bench baud rate towards the FPGA bridge.
    pub const DEFAULT_BAUD: u32 = 1_000_000;

    /// Opens `port_name` at `baud_rate` with a one second read timeout.
    pub fn open(port_name: &str, baud_rate: u32) -> serialport::Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_secs(1))
            .open()?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut collected = Vec::with_capacity(n);
        let mut chunk = [0u8; 64];
        while collected.len() < n {
            let want = (n - collected.len()).min(chunk.len());
            match self.port.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(read) => collected.extend_from_slice(&chunk[..read]),
                // A timeout ends the read; the caller sees a short response.
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
        }
        Ok(collected)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }
}

/// In-memory stand-in for the FPGA bridge plus SRAM array.
///
/// Implements the full wire protocol against a private 512-cell array, so a
/// healthy chip can be simulated without hardware: reads echo whatever was
/// last written. Response truncation and a dead clock register can be
/// scripted to exercise the driver's failure paths.
pub struct SimChip {
    memory: [u8; ADDR_COUNT as usize],
    addr: u16,
    clk_factor: u8,
    delay_factor: u8,
    responses: VecDeque<u8>,
    addr_trace: Vec<u16>,
    truncate_responses: usize,
    ignore_set_clock: bool,
}

impl Default for SimChip {
    fn default() -> Self {
        Self::new()
    }
}

impl SimChip {
    /// Creates a chip with all cells zeroed and the address register at 0.
    pub fn new() -> Self {
        Self {
            memory: [0; ADDR_COUNT as usize],
            addr: 0,
            clk_factor: 25,
            delay_factor: 0,
            responses: VecDeque::new(),
            addr_trace: Vec::new(),
            truncate_responses: 0,
            ignore_set_clock: false,
        }
    }

    /// Every address selected via SetAddress, in arrival order.
    pub fn addr_trace(&self) -> &[u16] {
        &self.addr_trace
    }

    /// Current value of the chip's read-delay register.
    pub fn delay_factor(&self) -> u8 {
        self.delay_factor
    }

    /// Truncates the next `n` read responses to a single byte.
    pub fn truncate_next_responses(&mut self, n: usize) {
        self.truncate_responses = n;
    }

    /// Makes the chip drop SetClock commands on the floor.
    pub fn ignore_set_clock(&mut self) {
        self.ignore_set_clock = true;
    }

    fn queue_response(&mut self, bytes: [u8; 2]) {
        if self.truncate_responses > 0 {
            self.truncate_responses -= 1;
            self.responses.push_back(bytes[0]);
        } else {
            self.responses.push_back(bytes[0]);
            self.responses.push_back(bytes[1]);
        }
    }

    fn process_frame(&mut self, header: u8, word: u8) {
        match header >> 4 {
            0b0001 => {
                self.addr = (((header & 0x01) as u16) << 8) | word as u16;
                self.addr_trace.push(self.addr);
            }
            0b0010 => self.memory[self.addr as usize % self.memory.len()] = word,
            0b0011 => self.queue_response([(self.addr >> 8) as u8, (self.addr & 0xFF) as u8]),
            0b0100 => {
                let value = self.memory[self.addr as usize % self.memory.len()];
                self.queue_response([0x00, value]);
            }
            0b0101 => {
                if !self.ignore_set_clock {
                    self.clk_factor = word;
                }
            }
            0b0110 => self.queue_response([0x00, self.clk_factor]),
            0b0111 => self.delay_factor = word,
            _ => {}
        }
    }
}

impl Transport for SimChip {
    fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let take = n.min(self.responses.len());
        Ok(self.responses.drain(..take).collect())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        for frame in bytes.chunks_exact(2) {
            self.process_frame(frame[0], frame[1]);
        }
        Ok(())
    }
}
