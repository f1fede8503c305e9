//! Memory fault-characterization tests.
//!
//! Each test sweeps the full array, recording per-stage fault lists and
//! observed-value bitmaps. Faults are data, not errors: a test never aborts
//! on a mismatch, and a corrupted response shows up as an unknown observed
//! value in the fault list rather than masking anything. The only fatal
//! condition is a clock readback disagreeing during a scan, which would
//! invalidate every timing-dependent result taken afterwards.

use std::collections::BTreeMap;

use rand::Rng;
use tracing::{error, info, warn};

use crate::codec::ADDR_COUNT;
use crate::driver::{clk_mhz, DriverError, SramDriver};
use crate::transport::Transport;

/// Stage recording the first verify-zeros pass.
pub const STAGE_TO_ZERO: &str = "-> 0";
/// Stage recording the zero-to-one transition verify.
pub const STAGE_ZERO_TO_ONE: &str = "0 -> 1";
/// Stage recording the one-to-zero transition verify.
pub const STAGE_ONE_TO_ZERO: &str = "1 -> 0";
/// Single stage of the pattern test.
pub const STAGE_PATTERN: &str = "pattern";
/// Full-array random write+verify passes.
pub const STAGE_RAND_STATIC: &str = "rand_static";
/// Single-address random read/write steps.
pub const STAGE_RAND_DYNAMIC: &str = "rand_dynamic";
/// Address set-and-read-back sweep over the FPGA link.
pub const STAGE_SERIAL: &str = "serial";

/// Default pattern-test values; doubled with their reverse before writing.
pub const DEFAULT_PATTERN_VALUES: [u8; 10] = [85, 1, 2, 4, 8, 16, 32, 64, 128, 170];
/// Default single-bit-test masks, one per bit.
pub const DEFAULT_SINGLE_BIT_VALUES: [u8; 8] = [1, 2, 4, 8, 16, 32, 64, 128];
/// Default clock divisors swept by the suite, fastest last.
pub const DEFAULT_CLK_FACTORS: [u8; 6] = [25, 10, 5, 3, 2, 1];
/// Default full-array passes of the random test.
pub const DEFAULT_N_STATIC: usize = 2;
/// Default single-address steps of the random test.
pub const DEFAULT_N_DYNAMIC: usize = 2_500;

/// One verify disagreement.
///
/// Words are cell values for the memory tests and addresses for the
/// serial-link stage; `None` means the readback was corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Cell the verify targeted.
    pub addr: u16,
    /// Shadow expectation before the read.
    pub expected: Option<u16>,
    /// What the read produced.
    pub observed: Option<u16>,
}

/// One observed-value snapshot, recorded whether or not a fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapEntry {
    /// Cell the snapshot belongs to.
    pub addr: u16,
    /// Value seen by the verify read.
    pub observed: Option<u16>,
}

/// Faults and bitmap gathered under one stage name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageRecord {
    /// Verify disagreements, in detection order.
    pub faults: Vec<Fault>,
    /// Every verify snapshot, in traversal order.
    pub bitmap: Vec<BitmapEntry>,
}

/// Per-stage results of one test run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestResult {
    stages: BTreeMap<String, StageRecord>,
}

impl TestResult {
    fn stage_mut(&mut self, name: &str) -> &mut StageRecord {
        self.stages.entry(name.to_string()).or_default()
    }

    /// Record for one stage, if the test ran it.
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.get(name)
    }

    /// All stages in name order.
    pub fn stages(&self) -> impl Iterator<Item = (&str, &StageRecord)> {
        self.stages.iter().map(|(name, record)| (name.as_str(), record))
    }

    /// Fault count across all stages.
    pub fn total_faults(&self) -> usize {
        self.stages.values().map(|record| record.faults.len()).sum()
    }
}

/// Result of scanning one test over several clock divisors, keyed by factor.
pub type ClkScanResult = BTreeMap<u8, TestResult>;

/// Results of the whole suite, keyed by test name.
pub type SuiteResult = BTreeMap<&'static str, ClkScanResult>;

fn bit_stage(value: u8) -> String {
    format!("{:08b}", value)
}

impl<T: Transport> SramDriver<T> {
    /// Reads the current cell and compares it against the shadow expectation.
    ///
    /// Appends a bitmap entry always and a fault on mismatch. An unknown
    /// observed value against a known expectation counts as a fault.
    fn verify(&mut self, addr: u16, result: &mut TestResult, stage: &str) -> Result<(), DriverError> {
        let expected = self.cell(addr).map(u16::from);
        self.read_value()?;
        let observed = self.cell(addr).map(u16::from);
        let record = result.stage_mut(stage);
        record.bitmap.push(BitmapEntry { addr, observed });
        if observed != expected {
            record.faults.push(Fault {
                addr,
                expected,
                observed,
            });
        }
        Ok(())
    }

    fn log_summary(&self, result: &TestResult) {
        info!("Summary:");
        info!("stage\tfaults");
        for (name, record) in result.stages() {
            info!("{}\t{}", name, record.faults.len());
        }
    }

    /// Sets every address and reads it back, independent of the SRAM array.
    ///
    /// Exercises the FPGA link alone; faults land under the "serial" stage
    /// with the commanded and read-back addresses as the words.
    pub fn serial_link_test(&mut self) -> Result<TestResult, DriverError> {
        info!(" ~ Start serial test ~");
        let mut result = TestResult::default();
        info!("Set addr and read back");
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;
            self.read_addr()?;
            let observed = self.curr_addr();
            let record = result.stage_mut(STAGE_SERIAL);
            record.bitmap.push(BitmapEntry { addr, observed });
            if observed != Some(addr) {
                record.faults.push(Fault {
                    addr,
                    expected: Some(addr),
                    observed,
                });
            }
        }
        self.log_summary(&result);
        info!(" ~ End serial test ~");
        Ok(result)
    }

    /// Runs the MATS++ march: write-0 pass, verify+write-1 pass,
    /// verify+write-0 pass, final verify pass, all ascending.
    ///
    /// Detects stuck-at and transition faults. Verify stages are keyed
    /// "-> 0", "0 -> 1" and "1 -> 0".
    pub fn mats_test(&mut self) -> Result<TestResult, DriverError> {
        info!(" ~ Start MATS++ test ~");
        let mut result = TestResult::default();

        info!("Set -> 0");
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;
            self.write_value(0)?;
        }

        info!("Verify 0 and set 0 -> 1");
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;
            self.verify(addr, &mut result, STAGE_TO_ZERO)?;
            self.write_value(255)?;
        }

        info!("Verify 1 and set 1 -> 0");
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;
            self.verify(addr, &mut result, STAGE_ZERO_TO_ONE)?;
            self.write_value(0)?;
        }

        info!("Verify 0");
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;
            self.verify(addr, &mut result, STAGE_ONE_TO_ZERO)?;
        }

        self.log_summary(&result);
        info!(" ~ End MATS++ test ~");
        Ok(result)
    }

    /// Writes `test_values` followed by its reverse cyclically over the
    /// array, then verifies every cell once under the "pattern" stage.
    pub fn pattern_test(&mut self, test_values: &[u8]) -> Result<TestResult, DriverError> {
        info!(" ~ Start pattern test ~");
        let mut result = TestResult::default();
        if test_values.is_empty() {
            warn!("pattern test invoked with no test values");
            return Ok(result);
        }

        let mut sequence = test_values.to_vec();
        sequence.extend(test_values.iter().rev());
        info!("Write pattern:");
        for value in &sequence {
            info!("{:08b}", value);
        }
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;
            self.write_value(sequence[addr as usize % sequence.len()])?;
        }

        info!("Verify");
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;
            self.verify(addr, &mut result, STAGE_PATTERN)?;
        }

        self.log_summary(&result);
        info!(" ~ End pattern test ~");
        Ok(result)
    }

    /// Zero-fills the array, then per cell walks `test_values` with a
    /// write+verify for each, ending with a return to zero.
    ///
    /// Verifies interleave with writes within one cell rather than per pass,
    /// isolating bit-coupling faults local to that cell. Stages are keyed by
    /// the written value's binary string, plus "-> 0" for the initial check.
    pub fn single_bit_test(&mut self, test_values: &[u8]) -> Result<TestResult, DriverError> {
        info!(" ~ Start single bit test ~");
        info!(
            "Values: {:?}",
            test_values.iter().map(|v| bit_stage(*v)).collect::<Vec<_>>()
        );
        let mut result = TestResult::default();

        info!("Set -> 0");
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;
            self.write_value(0)?;
        }

        info!("Perform single bit write and verification");
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;

            self.verify(addr, &mut result, STAGE_TO_ZERO)?;

            for &value in test_values {
                self.write_value(value)?;
                self.verify(addr, &mut result, &bit_stage(value))?;
            }

            self.write_value(0)?;
            self.verify(addr, &mut result, &bit_stage(0))?;
        }

        self.log_summary(&result);
        info!(" ~ End single bit test ~");
        Ok(result)
    }

    /// Random write/read stress.
    ///
    /// Primes the shadow with one full readback (no faults recorded), then
    /// issues `n_static` full-array random-write+verify passes under
    /// "rand_static" and `n_dynamic` single-address steps under
    /// "rand_dynamic", each step a coin flip between an unverified random
    /// write and a verify of the current value. The caller supplies the RNG
    /// so runs are reproducible from a seed.
    pub fn rand_test<R: Rng>(
        &mut self,
        n_static: usize,
        n_dynamic: usize,
        rng: &mut R,
    ) -> Result<TestResult, DriverError> {
        info!(" ~ Start random test ~");
        let mut result = TestResult::default();

        info!("Store current state");
        for addr in 0..ADDR_COUNT {
            self.set_addr(addr)?;
            self.read_value()?;
        }

        for i in 0..n_static {
            info!("Static RW {}/{}", i + 1, n_static);
            for addr in 0..ADDR_COUNT {
                self.set_addr(addr)?;
                self.write_value(rng.gen())?;
            }
            for addr in 0..ADDR_COUNT {
                self.set_addr(addr)?;
                self.verify(addr, &mut result, STAGE_RAND_STATIC)?;
            }
        }

        let report_every = (n_dynamic / 10).max(1);
        for i in 0..n_dynamic {
            if i % report_every == 0 {
                info!("Dynamic RW {}/{}", i, n_dynamic);
            }
            let addr = rng.gen_range(0..ADDR_COUNT);
            self.set_addr(addr)?;
            if rng.gen_bool(0.5) {
                self.write_value(rng.gen())?;
            } else {
                self.verify(addr, &mut result, STAGE_RAND_DYNAMIC)?;
            }
        }

        self.log_summary(&result);
        info!(" ~ End random test ~");
        Ok(result)
    }
}

/// Repeats `test` across clock divisors, keyed by factor.
///
/// Each divisor is commanded and read back first; a disagreement is fatal
/// because every later measurement would run at the wrong frequency.
pub fn run_clk_scan<T, F>(
    driver: &mut SramDriver<T>,
    clk_factors: &[u8],
    mut test: F,
) -> Result<ClkScanResult, DriverError>
where
    T: Transport,
    F: FnMut(&mut SramDriver<T>) -> Result<TestResult, DriverError>,
{
    info!(" ~~ Clock scan start ~~");
    let mut results = ClkScanResult::new();
    for &factor in clk_factors {
        info!("Set clk to {} MHz", clk_mhz(factor));
        driver.set_clk(factor)?;
        let observed = driver.read_clk()?;
        if observed != Some(factor) {
            error!("Clk not set! Readback {:?}", observed);
            return Err(DriverError::ClockMismatch {
                requested: factor,
                observed,
            });
        }
        results.insert(factor, test(driver)?);
    }
    info!(" ~~ Clock scan end ~~");
    Ok(results)
}

/// Clock-scans all four memory tests with their default parameters.
pub fn run_test_suite<T: Transport, R: Rng>(
    driver: &mut SramDriver<T>,
    clk_factors: &[u8],
    rng: &mut R,
) -> Result<SuiteResult, DriverError> {
    info!(" ~~ Test suite start ~~");
    let mut suite = SuiteResult::new();
    suite.insert("mats", run_clk_scan(driver, clk_factors, |d| d.mats_test())?);
    suite.insert(
        "pattern",
        run_clk_scan(driver, clk_factors, |d| d.pattern_test(&DEFAULT_PATTERN_VALUES))?,
    );
    suite.insert(
        "single_bit",
        run_clk_scan(driver, clk_factors, |d| {
            d.single_bit_test(&DEFAULT_SINGLE_BIT_VALUES)
        })?,
    );
    suite.insert(
        "rand",
        run_clk_scan(driver, clk_factors, |d| {
            d.rand_test(DEFAULT_N_STATIC, DEFAULT_N_DYNAMIC, rng)
        })?,
    );
    info!(" ~~ Test suite end ~~");
    Ok(suite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureLog;
    use crate::driver::SessionConfig;
    use crate::transport::SimChip;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io;
    use std::time::Duration;

    fn bench_driver(chip: SimChip) -> SramDriver<SimChip> {
        let config = SessionConfig {
            settle: Duration::ZERO,
            ..SessionConfig::default()
        };
        SramDriver::new(chip, CaptureLog::with_writer(io::sink()), config).unwrap()
    }

    fn assert_full_ascending_sweep(record: &StageRecord) {
        assert_eq!(record.bitmap.len(), ADDR_COUNT as usize);
        for (i, entry) in record.bitmap.iter().enumerate() {
            assert_eq!(entry.addr, i as u16);
        }
    }

    #[test]
    fn mats_on_healthy_chip_is_fault_free() {
        let mut driver = bench_driver(SimChip::new());
        let result = driver.mats_test().unwrap();
        assert_eq!(result.total_faults(), 0);
        let names: Vec<&str> = result.stages().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec![STAGE_TO_ZERO, STAGE_ZERO_TO_ONE, STAGE_ONE_TO_ZERO]
        );
        for (_, record) in result.stages() {
            assert_full_ascending_sweep(record);
        }
    }

    #[test]
    fn mats_issues_four_ascending_passes() {
        let mut driver = bench_driver(SimChip::new());
        driver.mats_test().unwrap();
        let chip = driver.release_io().unwrap();
        let trace = chip.addr_trace();
        assert_eq!(trace.len(), 4 * ADDR_COUNT as usize);
        for pass in trace.chunks_exact(ADDR_COUNT as usize) {
            for (i, &addr) in pass.iter().enumerate() {
                assert_eq!(addr, i as u16);
            }
        }
    }

    #[test]
    fn mats_final_state_is_all_zero() {
        let mut driver = bench_driver(SimChip::new());
        driver.mats_test().unwrap();
        assert!(driver.memory().iter().all(|cell| *cell == Some(0)));
    }

    #[test]
    fn mats_records_corrupted_response_as_fault() {
        let mut chip = SimChip::new();
        // Corrupt the very first verify readback.
        chip.truncate_next_responses(1);
        let mut driver = bench_driver(chip);
        let result = driver.mats_test().unwrap();
        let stage = result.stage(STAGE_TO_ZERO).unwrap();
        assert_eq!(stage.faults.len(), 1);
        assert_eq!(
            stage.faults[0],
            Fault {
                addr: 0,
                expected: Some(0),
                observed: None,
            }
        );
        assert_eq!(result.total_faults(), 1);
    }

    #[test]
    fn pattern_writes_doubled_sequence() {
        let mut driver = bench_driver(SimChip::new());
        let result = driver.pattern_test(&DEFAULT_PATTERN_VALUES).unwrap();
        assert_eq!(result.total_faults(), 0);

        let mut sequence = DEFAULT_PATTERN_VALUES.to_vec();
        sequence.extend(DEFAULT_PATTERN_VALUES.iter().rev());
        assert_eq!(sequence.len(), 20);

        let stage = result.stage(STAGE_PATTERN).unwrap();
        assert_full_ascending_sweep(stage);
        for addr in 0..ADDR_COUNT {
            let expected = sequence[addr as usize % sequence.len()];
            assert_eq!(driver.cell(addr), Some(expected));
            assert_eq!(stage.bitmap[addr as usize].observed, Some(expected as u16));
        }
    }

    #[test]
    fn single_bit_cycles_masks_and_returns_to_zero() {
        let mut driver = bench_driver(SimChip::new());
        let result = driver.single_bit_test(&DEFAULT_SINGLE_BIT_VALUES).unwrap();
        assert_eq!(result.total_faults(), 0);

        let mut expected_stages: Vec<String> = vec![STAGE_TO_ZERO.to_string()];
        expected_stages.extend(DEFAULT_SINGLE_BIT_VALUES.iter().map(|v| format!("{:08b}", v)));
        expected_stages.push("00000000".to_string());
        for name in &expected_stages {
            let record = result.stage(name).unwrap();
            assert_eq!(record.bitmap.len(), ADDR_COUNT as usize);
        }

        // Last operation per cell is write 0 + verify.
        assert!(driver.memory().iter().all(|cell| *cell == Some(0)));
    }

    #[test]
    fn rand_test_is_reproducible_from_seed() {
        let run = |seed: u64| {
            let mut driver = bench_driver(SimChip::new());
            let mut rng = StdRng::seed_from_u64(seed);
            driver.rand_test(2, 200, &mut rng).unwrap()
        };
        assert_eq!(run(7), run(7));
        assert_ne!(run(7), run(8));
    }

    #[test]
    fn rand_test_issues_expected_operation_counts() {
        let n_static = 2;
        let n_dynamic = 100;
        let mut driver = bench_driver(SimChip::new());
        let mut rng = StdRng::seed_from_u64(42);
        let result = driver.rand_test(n_static, n_dynamic, &mut rng).unwrap();
        assert_eq!(result.total_faults(), 0);

        let static_stage = result.stage(STAGE_RAND_STATIC).unwrap();
        assert_eq!(static_stage.bitmap.len(), n_static * ADDR_COUNT as usize);

        let dynamic_stage = result.stage(STAGE_RAND_DYNAMIC).unwrap();
        assert!(dynamic_stage.bitmap.len() <= n_dynamic);

        // Priming sweep + one select per static write and verify + one per
        // dynamic step.
        let chip = driver.release_io().unwrap();
        let selects = chip.addr_trace().len();
        assert_eq!(
            selects,
            ADDR_COUNT as usize + n_static * 2 * ADDR_COUNT as usize + n_dynamic
        );
    }

    #[test]
    fn serial_link_test_round_trips_every_address() {
        let mut driver = bench_driver(SimChip::new());
        let result = driver.serial_link_test().unwrap();
        assert_eq!(result.total_faults(), 0);
        assert_full_ascending_sweep(result.stage(STAGE_SERIAL).unwrap());
    }

    #[test]
    fn clk_scan_runs_test_per_factor() {
        let mut driver = bench_driver(SimChip::new());
        let results =
            run_clk_scan(&mut driver, &[25, 5], |d| d.pattern_test(&DEFAULT_PATTERN_VALUES))
                .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.contains_key(&25));
        assert!(results.contains_key(&5));
        assert_eq!(driver.clk_factor(), Some(5));
    }

    #[test]
    fn clk_scan_fails_fast_on_dead_clock_register() {
        let mut chip = SimChip::new();
        chip.ignore_set_clock();
        let mut driver = bench_driver(chip);
        let result = run_clk_scan(&mut driver, &[5], |d| d.mats_test());
        match result {
            Err(DriverError::ClockMismatch {
                requested: 5,
                observed: Some(25),
            }) => {}
            other => panic!("expected clock mismatch, got {:?}", other.map(|_| ())),
        }
    }
}
