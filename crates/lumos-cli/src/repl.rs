//! REPL – operator shell over a running [`TreatmentSystem`].
//!
//! Supported slash-commands:
//!   /help                     – show this list
//!   /status                   – safety state, interlocks, engine and watchdog
//!   /arm  /disarm             – enter / leave the laser-capable states
//!   /estop                    – emergency stop
//!   /reset                    – leave emergency stop
//!   /session open|close       – mark the treatment session valid / invalid
//!   /interlock open|close     – open / close the simulated interlock line
//!   /link up|down             – simulate loss of the supervisor link
//!   /fault stage|laser <n>    – make the next n device commands fail
//!   /run <file>               – execute a JSON protocol file
//!   /cancel                   – cancel the active run
//!   /schema                   – print the protocol JSON schema
//!   /quit | /exit             – shut down and exit

use colored::Colorize;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use lumos_hal::DeviceRole;
use lumos_runtime::{SimulatedRig, TreatmentSystem};
use lumos_types::{
    HardwareErrorKind, InterlockFact, LineBasedProtocol, LumosError, SafetyState, StatusSnapshot,
};
use tokio::runtime::Runtime;

/// Which simulated device a `/fault` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Stage,
    Laser,
}

/// One parsed shell line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Arm,
    Disarm,
    EmergencyStop,
    Reset,
    Session(bool),
    Interlock(bool),
    Link(bool),
    Fault(Device, u32),
    Run(PathBuf),
    Cancel,
    Schema,
    Quit,
    Empty,
    /// Known command with bad arguments; carries the usage line.
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Command::Empty;
        };
        let arg = words.next();
        match (head, arg) {
            ("/help", _) => Command::Help,
            ("/status", _) => Command::Status,
            ("/arm", _) => Command::Arm,
            ("/disarm", _) => Command::Disarm,
            ("/estop", _) => Command::EmergencyStop,
            ("/reset", _) => Command::Reset,
            ("/session", Some("open")) => Command::Session(true),
            ("/session", Some("close")) => Command::Session(false),
            ("/session", _) => Command::Usage("/session open|close"),
            ("/interlock", Some("close")) => Command::Interlock(true),
            ("/interlock", Some("open")) => Command::Interlock(false),
            ("/interlock", _) => Command::Usage("/interlock open|close"),
            ("/link", Some("up")) => Command::Link(true),
            ("/link", Some("down")) => Command::Link(false),
            ("/link", _) => Command::Usage("/link up|down"),
            ("/fault", Some(device)) => {
                let device = match device {
                    "stage" => Device::Stage,
                    "laser" => Device::Laser,
                    _ => return Command::Usage("/fault stage|laser <count>"),
                };
                match words.next().map(str::parse::<u32>) {
                    Some(Ok(count)) => Command::Fault(device, count),
                    None => Command::Fault(device, 1),
                    Some(Err(_)) => Command::Usage("/fault stage|laser <count>"),
                }
            }
            ("/fault", None) => Command::Usage("/fault stage|laser <count>"),
            ("/run", Some(path)) => Command::Run(PathBuf::from(path)),
            ("/run", None) => Command::Usage("/run <protocol.json>"),
            ("/cancel", _) => Command::Cancel,
            ("/schema", _) => Command::Schema,
            ("/quit" | "/exit", _) => Command::Quit,
            (other, _) => Command::Unknown(other.to_string()),
        }
    }
}

/// Entry point for the interactive REPL.  Returns on `/quit` or EOF.
pub fn run(runtime: &Runtime, system: &TreatmentSystem, rig: &SimulatedRig) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("{} ", prompt(system.status().safety_state));
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        match Command::parse(line.trim()) {
            Command::Empty => {}
            Command::Help => cmd_help(),
            Command::Status => cmd_status(system),
            Command::Arm => report("Armed", system.arm()),
            Command::Disarm => report("Disarmed", system.disarm()),
            Command::EmergencyStop => {
                system.emergency_stop();
                println!("{}", "■ EMERGENCY STOP".red().bold());
            }
            Command::Reset => report("Emergency stop cleared", system.reset_from_emergency()),
            Command::Session(valid) => {
                system.interlocks().set_session_valid(valid);
                println!("  Session {}", if valid { "open".green() } else { "closed".yellow() });
            }
            Command::Interlock(closed) => {
                rig.laser.set_interlock_line(closed);
                println!(
                    "  Interlock line {}",
                    if closed { "closed".green() } else { "open".red() }
                );
            }
            Command::Link(up) => {
                rig.supervisor.set_link_down(!up);
                println!("  Supervisor link {}", if up { "up".green() } else { "down".red() });
            }
            Command::Fault(device, count) => {
                match device {
                    Device::Stage => rig.stage.fail_next(count, HardwareErrorKind::Transient),
                    Device::Laser => rig.laser.fail_next(count, HardwareErrorKind::Transient),
                }
                println!("  Next {count} {device:?} command(s) will fail");
            }
            Command::Run(path) => cmd_run(runtime, system, &path),
            Command::Cancel => {
                if system.cancel() {
                    println!("  Cancellation requested");
                } else {
                    println!("  {}", "No active run".dimmed());
                }
            }
            Command::Schema => println!("{}", LineBasedProtocol::json_schema()),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                break;
            }
            Command::Usage(usage) => println!("{} {}", "Usage:".yellow(), usage.bold()),
            Command::Unknown(other) => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Lumos Commands".bold().underline());
    let rows = [
        ("/status", "safety state, interlocks, engine, watchdog"),
        ("/arm  /disarm", "enter / leave the laser-capable states"),
        ("/estop", "emergency stop (also Ctrl-C)"),
        ("/reset", "leave emergency stop"),
        ("/session open|close", "mark the treatment session valid"),
        ("/interlock open|close", "simulated hardware interlock line"),
        ("/link up|down", "simulated supervisor link"),
        ("/fault stage|laser <n>", "fail the next n device commands"),
        ("/run <file>", "execute a JSON protocol"),
        ("/cancel", "cancel the active run"),
        ("/schema", "print the protocol JSON schema"),
        ("/quit  /exit", "shut down and exit"),
    ];
    for (cmd, what) in rows {
        println!("  {:<24} – {}", cmd.bold().cyan(), what);
    }
    println!();
}

fn cmd_status(system: &TreatmentSystem) {
    let status = system.status();
    println!("{}", "System Status".bold().underline());
    println!("  Safety state    : {}", paint_state(status.safety_state));
    println!(
        "  Laser permitted : {}",
        if status.laser_permitted { "yes".green() } else { "no".red() }
    );
    println!("  Engine          : {}", status.engine_state.to_string().yellow());
    let denying = status.interlocks.unsatisfied();
    for fact in InterlockFact::ALL {
        println!(
            "  {:<24}: {}",
            fact.to_string(),
            if denying.contains(&fact) { "DENY".red().bold() } else { "ok".green() }
        );
    }
    println!(
        "  Heartbeats      : {} sent, {} failed",
        status.heartbeats_sent, status.heartbeat_failures
    );
    if status.audit_failures > 0 {
        println!(
            "  Audit log       : {}",
            format!("{} event(s) not persisted", status.audit_failures).red().bold()
        );
    }
    for (role, device) in &status.devices {
        println!("  {:<16}: {}", role.to_string(), describe_device(*role, device));
    }
}

fn describe_device(role: DeviceRole, status: &StatusSnapshot) -> String {
    if !status.connected {
        return "disconnected".red().to_string();
    }
    let reading = match role {
        DeviceRole::Motion => format!("{:.2} mm", status.position_mm.unwrap_or(0.0)),
        DeviceRole::Laser => format!("{:.2} W", status.laser_power_w.unwrap_or(0.0)),
    };
    match &status.fault {
        Some(fault) => format!("{reading} {}", fault.red()),
        None if status.busy => format!("{reading} (busy)"),
        None => reading,
    }
}
