// servo-bus: command line access to a Feetech or Dynamixel servo bus
//
// Usage: servo-bus [--config config/bus.toml] [--simulate] <command>
// Example: servo-bus --port /dev/ttyACM0 diagnose
//
// Every command reads the bus and motor list from the TOML config. With
// --simulate the same commands run against a simulated line.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use servo_bus::config::{BusConfig, RANGE_SAMPLE_PERIOD};
use servo_bus::motor::{
    CalibrationFile, MotorCalibration, MotorsBus, OperatingMode, SimulatedLine,
};
use servo_bus::motor::transport::available_ports;

#[derive(Parser)]
#[command(name = "servo-bus", version, about = "Talk to Feetech and Dynamixel servo buses")]
struct Cli {
    /// Bus configuration file
    #[arg(short, long, default_value = "config/bus.toml")]
    config: PathBuf,

    /// Serial port, overriding the config file
    #[arg(short, long)]
    port: Option<String>,

    /// Run against a simulated line instead of the serial port
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Broadcast-ping at every baudrate of the protocol
    Scan,
    /// Ping motors (all configured ones by default)
    Ping {
        ids: Vec<u8>,
        /// Use a single broadcast ping instead
        #[arg(long)]
        broadcast: bool,
    },
    /// Read a register from motors (all configured ones by default)
    Read {
        register: String,
        ids: Vec<u8>,
        /// Skip calibration and print register values as stored
        #[arg(long)]
        raw: bool,
    },
    /// Write a register on one motor
    Write {
        register: String,
        id: u8,
        #[arg(allow_negative_numbers = true)]
        value: f64,
        #[arg(long)]
        raw: bool,
    },
    /// Enable or disable torque
    Torque { state: TorqueState, ids: Vec<u8> },
    /// Change the operating mode
    Mode { mode: ModeArg, ids: Vec<u8> },
    /// Record homing offsets and ranges of motion, then save them
    Calibrate {
        ids: Vec<u8>,
        /// Calibration file, overriding the config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Give a freshly installed motor its configured id and baudrate
    Setup {
        current_id: u8,
        new_id: u8,
        #[arg(long)]
        baudrate: Option<u32>,
    },
    /// Read-only health report of every configured motor
    Diagnose,
}

#[derive(Clone, Copy, ValueEnum)]
enum TorqueState {
    On,
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Position,
    Velocity,
    Pwm,
    Step,
    Current,
    ExtendedPosition,
    CurrentBasedPosition,
}

impl From<ModeArg> for OperatingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Position => OperatingMode::Position,
            ModeArg::Velocity => OperatingMode::Velocity,
            ModeArg::Pwm => OperatingMode::Pwm,
            ModeArg::Step => OperatingMode::Step,
            ModeArg::Current => OperatingMode::Current,
            ModeArg::ExtendedPosition => OperatingMode::ExtendedPosition,
            ModeArg::CurrentBasedPosition => OperatingMode::CurrentBasedPosition,
        }
    }
}

fn main() -> Result<()> {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = BusConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let (mut bus, line) = if cli.simulate {
        let (bus, line) = config.simulated_bus()?;
        info!("Using a simulated line with motors {:?}", line.device_ids());
        (bus, Some(line))
    } else {
        (config.serial_bus()?, None)
    };

    let handshake = !matches!(
        cli.command,
        Command::Scan | Command::Ping { .. } | Command::Setup { .. } | Command::Diagnose
    );
    if let Err(e) = bus.connect(handshake) {
        if !cli.simulate
            && let Ok(ports) = available_ports()
        {
            warn!("Serial ports on this machine: {:?}", ports);
        }
        return Err(e).with_context(|| format!("connecting to {}", config.port));
    }

    let result = run(&mut bus, &config, line.as_ref(), cli.command);
    // Torque stays as the command left it
    if let Err(e) = bus.disconnect_with(false) {
        warn!("Disconnect failed: {}", e);
    }
    result
}

fn run(
    bus: &mut MotorsBus,
    config: &BusConfig,
    line: Option<&SimulatedLine>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Scan => scan(bus),
        Command::Ping { ids, broadcast } => ping(bus, &or_all(bus, ids), broadcast),
        Command::Read { register, ids, raw } => read(bus, &register, &or_all(bus, ids), raw),
        Command::Write {
            register,
            id,
            value,
            raw,
        } => {
            if !value.is_finite() {
                bail!("{} is not a register value", value);
            }
            if raw {
                bus.write_raw(&register, id, value.round() as i64)?;
            } else {
                bus.write(&register, id, value)?;
            }
            println!("Motor {}: {} <- {}", id, register, value);
            Ok(())
        }
        Command::Torque { state, ids } => {
            let ids = or_all(bus, ids);
            match state {
                TorqueState::On => bus.enable_torque(&ids)?,
                TorqueState::Off => bus.disable_torque(&ids)?,
            }
            println!("Torque {} on {:?}", if matches!(state, TorqueState::On) { "enabled" } else { "disabled" }, ids);
            Ok(())
        }
        Command::Mode { mode, ids } => {
            let ids = or_all(bus, ids);
            bus.set_operating_mode(&ids, mode.into())?;
            println!("Motors {:?} now in {:?} mode", ids, OperatingMode::from(mode));
            Ok(())
        }
        Command::Calibrate { ids, output } => {
            let ids = or_all(bus, ids);
            let Some(path) = output.or_else(|| config.calibration_path.clone()) else {
                bail!("no calibration file: pass --output or set calibration_path");
            };
            if let Some(line) = line {
                // Simulated joints sweep a little around mid-turn
                for &id in &ids {
                    line.script_positions(id, [2048, 1400, 2700, 2048]);
                }
            }
            calibrate(bus, &ids, &path)
        }
        Command::Setup {
            current_id,
            new_id,
            baudrate,
        } => {
            let baudrate = baudrate.unwrap_or(config.baudrate);
            if !confirm(&format!(
                "Only one motor must be connected. Give motor {} id {} at {} baud?",
                current_id, new_id, baudrate
            ))? {
                println!("Aborted.");
                return Ok(());
            }
            bus.setup_device(current_id, new_id, baudrate)?;
            println!("✓ Motor {} is now id {} at {} baud", current_id, new_id, baudrate);
            Ok(())
        }
        Command::Diagnose => diagnose(bus),
    }
}

fn or_all(bus: &MotorsBus, ids: Vec<u8>) -> Vec<u8> {
    if ids.is_empty() { bus.device_ids() } else { ids }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn wait_for_enter(prompt: &str) -> Result<()> {
    print!("{} ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(())
}

fn scan(bus: &mut MotorsBus) -> Result<()> {
    println!("Scanning {} ({:?})...", bus.port_name(), bus.family());
    let found = bus.scan_port()?;
    if found.is_empty() {
        println!("  ✗ No motors found");
    }
    for (baudrate, ids) in found {
        println!("  {:>9} baud: {:?}", baudrate, ids);
    }
    Ok(())
}

fn ping(bus: &mut MotorsBus, ids: &[u8], broadcast: bool) -> Result<()> {
    let found: BTreeMap<u8, Option<u16>> = if broadcast {
        bus.broadcast_ping()?
            .into_iter()
            .map(|(id, number)| (id, Some(number)))
            .collect()
    } else {
        let mut found = BTreeMap::new();
        for &id in ids {
            found.insert(id, bus.ping(id)?);
        }
        found
    };

    for (id, number) in found {
        match number {
            Some(number) => {
                let model = bus
                    .control_table()
                    .model_for_number(bus.family(), number)
                    .map_or("unknown model", |m| m.name);
                println!("  Motor {}: ✓ model number {} ({})", id, number, model);
            }
            None => println!("  Motor {}: ✗ NO RESPONSE", id),
        }
    }
    Ok(())
}

fn read(bus: &mut MotorsBus, register: &str, ids: &[u8], raw: bool) -> Result<()> {
    if raw {
        let report = bus.sync_read_raw(register, ids)?;
        for (id, value) in &report.values {
            println!("  Motor {}: {} = {}", id, register, value);
        }
        for (id, e) in &report.failures {
            println!("  Motor {}: ✗ {}", id, e);
        }
    } else {
        let report = bus.sync_read(register, ids)?;
        for (id, value) in &report.values {
            println!("  Motor {}: {} = {:.2}", id, register, value);
        }
        for (id, e) in &report.failures {
            println!("  Motor {}: ✗ {}", id, e);
        }
    }
    Ok(())
}

/// True once Enter, q or Esc is pressed within `timeout`
fn stop_key_pressed(timeout: std::time::Duration) -> bool {
    match event::poll(timeout) {
        Ok(true) => matches!(
            event::read(),
            Ok(Event::Key(KeyEvent {
                code: KeyCode::Enter | KeyCode::Char('q') | KeyCode::Esc,
                kind: KeyEventKind::Press,
                ..
            }))
        ),
        Ok(false) => false,
        Err(e) => {
            warn!("Keyboard polling failed, stopping: {}", e);
            true
        }
    }
}

fn calibrate(bus: &mut MotorsBus, ids: &[u8], path: &std::path::Path) -> Result<()> {
    println!("Calibrating motors {:?}", ids);
    bus.disable_torque(ids)?;

    wait_for_enter("Step 1: move every joint to the middle of its range, then press Enter.")?;
    let homings = bus.set_half_turn_homings(ids)?;
    for (id, offset) in &homings {
        println!("  Motor {}: homing offset {}", id, offset);
    }

    println!("Step 2: move every joint through its full range. Press Enter when done.");
    enable_raw_mode()?;
    let recorded = bus.record_ranges_of_motion(ids, |ranges| {
        let line: Vec<String> = ranges
            .iter()
            .map(|(id, (min, max))| format!("{}: {}..{}", id, min, max))
            .collect();
        print!("\r  {}", line.join("  "));
        let _ = io::stdout().flush();
        stop_key_pressed(RANGE_SAMPLE_PERIOD)
    });
    disable_raw_mode()?;
    println!();
    let ranges = recorded?;

    let records = ranges
        .iter()
        .map(|(&id, &(min, max))| {
            let current = bus.read_calibration().get(id).copied();
            let drive_mode = current.map(|c| c.drive_mode).unwrap_or_default();
            let homing = current.map_or(0, |c| c.homing_offset);
            MotorCalibration::new(id, drive_mode, homing, min, max)
        })
        .collect::<servo_bus::motor::Result<CalibrationFile>>()?;

    bus.write_calibration(records)?;
    bus.save_calibration(path)?;
    println!("✓ Calibration saved to {}", path.display());
    Ok(())
}

fn diagnose(bus: &mut MotorsBus) -> Result<()> {
    println!("Serial port: {} at {} baud", bus.port_name(), bus.baudrate());
    println!("Expected motor IDs: {:?}", bus.device_ids());
    println!();

    println!("Step 1: Pinging motors...");
    let mut responding = Vec::new();
    for id in bus.device_ids() {
        let expected = bus.model_of(id)?;
        let (name, number) = (expected.name, expected.model_number);
        match bus.ping(id) {
            Ok(Some(found)) if found == number => {
                println!("  Motor {} ({}): ✓ RESPONDING", id, name);
                responding.push(id);
            }
            Ok(Some(found)) => println!(
                "  Motor {}: ✗ reports model number {}, expected {} ({})",
                id, found, name, number
            ),
            Ok(None) => println!("  Motor {} ({}): ✗ NO RESPONSE", id, name),
            Err(e) => println!("  Motor {} ({}): ✗ ERROR: {}", id, name, e),
        }
    }
    println!();

    println!("Step 2: Reading motor registers...");
    const REGISTERS: [&str; 7] = [
        "Operating_Mode",
        "Torque_Enable",
        "Lock",
        "Present_Position",
        "Present_Velocity",
        "Present_Voltage",
        "Present_Temperature",
    ];
    for id in responding {
        println!("  === Motor {} ===", id);
        for register in REGISTERS {
            if bus.model_of(id)?.register(register).is_err() {
                continue;
            }
            match bus.read_raw(register, id) {
                Ok(value) => println!("    {:<20} {}", register, value),
                Err(e) => println!("    {:<20} ERROR - {}", register, e),
            }
        }
    }
    println!();

    if bus.is_calibrated() {
        println!("Calibration: ✓ every motor has a record");
    } else {
        println!("Calibration: ⚠ missing records, run `servo-bus calibrate`");
    }
    Ok(())
}
