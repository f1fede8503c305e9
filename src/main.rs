use cryosram::{
    run_test_suite, CaptureLog, SerialTransport, SessionConfig, SimChip, SramDriver, SuiteResult,
    Transport, DEFAULT_CLK_FACTORS,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::{self, Write};
use std::time::Duration;

// The main entry point for the command-line tester application.
fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    println!("==========================");
    println!("  Cryogenic SRAM Tester   ");
    println!("==========================");

    // Main menu loop.
    loop {
        println!("\nSelect mode:");
        println!("  1. Run test suite over serial port");
        println!("  2. Run test suite against simulated chip");
        println!("  3. Exit");
        print!("> ");
        io::stdout().flush().unwrap();

        let mut choice = String::new();
        io::stdin().read_line(&mut choice).unwrap();

        match choice.trim() {
            "1" => run_serial_mode(),
            "2" => run_sim_mode(),
            "3" => break,
            _ => eprintln!("[ERROR] Invalid choice. Please enter 1, 2, or 3."),
        }
    }
}

// Runs the full suite against the FPGA bridge on a real serial port.
fn run_serial_mode() {
    println!("\n--- Serial Mode ---");

    // List available serial ports.
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("[ERROR] Could not enumerate serial ports: {}", e);
            return;
        }
    };

    if ports.is_empty() {
        eprintln!("[ERROR] No serial ports found.");
        return;
    }

    println!("Available serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port.port_name);
    }

    // Get user's choice of serial port.
    print!("Select a port (number): ");
    io::stdout().flush().unwrap();
    let mut port_choice = String::new();
    io::stdin().read_line(&mut port_choice).unwrap();
    let port_index: usize = match port_choice.trim().parse() {
        Ok(i) if i < ports.len() => i,
        _ => {
            eprintln!("[ERROR] Invalid port selection.");
            return;
        }
    };
    let port_name = &ports[port_index].port_name;

    let transport = match SerialTransport::open(port_name, SerialTransport::DEFAULT_BAUD) {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("[ERROR] Failed to open port '{}': {}", port_name, e);
            return;
        }
    };

    println!(
        "Driving {} at {} baud.",
        port_name,
        SerialTransport::DEFAULT_BAUD
    );
    run_suite(transport, SessionConfig::default());
}

// Runs the full suite against the built-in chip model, no hardware needed.
fn run_sim_mode() {
    println!("\n--- Simulated Chip Mode ---");
    let config = SessionConfig {
        // The simulated chip has no electrical timing to respect.
        settle: Duration::ZERO,
        ..SessionConfig::default()
    };
    run_suite(SimChip::new(), config);
}

// Common path: build a captured driver session and run the suite on it.
fn run_suite<T: Transport>(transport: T, config: SessionConfig) {
    let capture_name = CaptureLog::default_filename();
    let capture = match CaptureLog::gzip_file(&capture_name) {
        Ok(capture) => capture,
        Err(e) => {
            eprintln!("[ERROR] Could not create capture file '{}': {}", capture_name, e);
            return;
        }
    };
    println!("Capturing serial traffic to {}", capture_name);

    let delay_factor = config.delay_factor;
    let mut driver = match SramDriver::new(transport, capture, config) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("[ERROR] Invalid session configuration: {}", e);
            return;
        }
    };

    // Command the configured read delay onto the chip before testing.
    if let Err(e) = driver.set_delay(delay_factor) {
        eprintln!("[ERROR] Failed to set read delay: {}", e);
        return;
    }

    let mut rng = StdRng::from_entropy();
    match run_test_suite(&mut driver, &DEFAULT_CLK_FACTORS, &mut rng) {
        Ok(suite) => print_suite_summary(&suite),
        Err(e) => eprintln!("[ERROR] Test suite aborted: {}", e),
    }

    if let Err(e) = driver.close_capture() {
        eprintln!("[ERROR] Failed to flush capture file: {}", e);
    }
}

// Prints per-test, per-clock, per-stage fault counts.
fn print_suite_summary(suite: &SuiteResult) {
    println!("\nSuite summary:");
    for (test_name, scan) in suite {
        for (clk_factor, result) in scan {
            for (stage, record) in result.stages() {
                println!(
                    "  {:<10} clk {:>3}  {:<10} {} faults",
                    test_name,
                    clk_factor,
                    stage,
                    record.faults.len()
                );
            }
        }
    }
}
