//! # Cryogenic SRAM Tester Library
//!
//! This library drives a cryogenic SRAM test chip through a serial FPGA
//! bridge. It encodes the chip's command set into bit-exact two-byte frames,
//! keeps a host-side shadow of the chip state, captures all serial traffic
//! for audit, and runs the standard battery of memory fault-characterization
//! tests (MATS++, pattern, single-bit, random) across clock settings.

pub mod capture;
pub mod codec;
pub mod driver;
pub mod engine;
pub mod transport;

pub use capture::{CaptureError, CaptureLog, CaptureTransport, CapturedEvent, Direction};
pub use codec::{Command, CodecError, ADDR_COUNT};
pub use driver::{clk_mhz, ConfigError, DriverError, SessionConfig, SramDriver};
pub use engine::{
    run_clk_scan, run_test_suite, BitmapEntry, ClkScanResult, Fault, StageRecord, SuiteResult,
    TestResult, DEFAULT_CLK_FACTORS, DEFAULT_N_DYNAMIC, DEFAULT_N_STATIC, DEFAULT_PATTERN_VALUES,
    DEFAULT_SINGLE_BIT_VALUES,
};
pub use transport::{SerialTransport, SimChip, Transport};
