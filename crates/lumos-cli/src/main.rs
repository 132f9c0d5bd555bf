//! `lumos-cli` – Lumos operator console.
//!
//! This binary runs the full safety core against simulated hardware.  It:
//!
//! 1. Loads `~/.lumos/config.toml`, running a **First-Run Wizard** when the
//!    file is absent.
//! 2. Starts the [`TreatmentSystem`] (safety coordinator, interlocks,
//!    watchdog, engine, audit log) on a multi-thread tokio runtime.
//! 3. Prints protocol progress and critical safety events as they happen.
//! 4. Drops the operator into an **interactive REPL** (`/help` for commands).
//! 5. Maps **Ctrl-C** to an emergency stop.

mod config;
mod repl;

use colored::Colorize;
use std::process::ExitCode;
use std::sync::Arc;

use lumos_middleware::{EventBus, Topic};
use lumos_runtime::{SafetyCoordinator, TreatmentSystem};
use lumos_types::{EventPayload, ProtocolOutcome, Severity};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};

fn main() -> ExitCode {
    let _telemetry = lumos_runtime::init_tracing("lumos-cli");

    print_banner();

    let home = config::home_dir();
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    let system_config = match cfg.system_config(&home) {
        Ok(c) => c,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("lumos-worker")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let started = runtime.block_on(async { TreatmentSystem::simulated(system_config) });
    let (system, rig) = match started {
        Ok(pair) => pair,
        Err(e) => {
            println!("{}: {}", "Startup failed".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = cfg.audit_path(&home) {
        println!("  Audit log      : {}", path.display().to_string().bold());
    }
    println!(
        "  Power ceiling  : {} W",
        cfg.power_ceiling_w.to_string().bold()
    );

    install_emergency_stop(Arc::clone(system.safety()));
    runtime.spawn(print_bus_events(system.bus().clone()));

    println!();
    println!(
        "  Open a session with {} then {} to enable the laser.",
        "/session open".bold().cyan(),
        "/arm".bold().cyan()
    );
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(&runtime, &system, &rig);

    match runtime.block_on(system.shutdown()) {
        Ok(written) => {
            println!("  {} {} audit event(s) written.", "✓".green().bold(), written);
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}: {}", "Shutdown error".red(), e);
            ExitCode::FAILURE
        }
    }
}

/// Ctrl-C asserts an emergency stop instead of killing the process, so the
/// operator keeps the console to inspect and reset.
fn install_emergency_stop(safety: Arc<SafetyCoordinator>) {
    if let Err(e) = ctrlc::set_handler(move || {
        safety.emergency_stop();
        println!();
        println!("{}", "■ Ctrl-C: EMERGENCY STOP asserted".red().bold());
        println!(
            "  Use {} to recover or {} to leave.",
            "/reset".bold(),
            "/quit".bold()
        );
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; use /estop instead");
    }
}

/// Echo protocol progress, outcomes and critical safety events to the console.
async fn print_bus_events(bus: EventBus) {
    let mut protocol = bus.subscribe_to(Topic::Protocol);
    let mut safety = bus.subscribe_to(Topic::SafetyEvents);
    loop {
        let received = tokio::select! {
            r = protocol.recv() => r,
            r = safety.recv() => r,
        };
        let event = match received {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "console fell behind the event bus");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event.payload {
            EventPayload::ProtocolProgress {
                line_index,
                loop_index,
                elapsed_ms,
            } => println!(
                "  {} loop {} line {} done ({:.1} s)",
                "·".cyan(),
                loop_index + 1,
                line_index + 1,
                elapsed_ms as f64 / 1000.0
            ),
            EventPayload::ProtocolTerminal { outcome } => {
                let text = outcome.to_string();
                let painted = match outcome {
                    ProtocolOutcome::Completed => text.green().bold(),
                    ProtocolOutcome::Cancelled => text.yellow().bold(),
                    ProtocolOutcome::Faulted(_) => text.red().bold(),
                };
                println!("  ■ Protocol {painted}");
            }
            EventPayload::SafetyEvent {
                severity: Severity::Critical,
                message,
                ..
            } => println!("  {} {}", "⚠".red().bold(), message.red()),
            _ => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        Lumos First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up Lumos.\n");

    let mut cfg = config::Config::default();

    let ceiling = prompt_line(
        &format!("  Laser power ceiling in W [{}]: ", cfg.power_ceiling_w),
        &cfg.power_ceiling_w.to_string(),
    );
    match ceiling.trim().parse::<f64>() {
        Ok(w) if w.is_finite() && w > 0.0 => cfg.power_ceiling_w = w,
        _ => println!("  {} keeping {} W", "Not a positive number,".yellow(), cfg.power_ceiling_w),
    }

    let audit = prompt_line("  Keep an audit log? [Y/n]: ", "y");
    cfg.audit_enabled = !audit.trim().eq_ignore_ascii_case("n");

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

fn print_banner() {
    println!();
    println!("{}", r#"   __                               "#.bold().cyan());
    println!("{}", r#"  / /  __ ____ _  ___  ___          "#.bold().cyan());
    println!("{}", r#" / /__/ // /  ' \/ _ \(_-<          "#.bold().cyan());
    println!("{}", r#"/____/\_,_/_/_/_/\___/___/          "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Lumos".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Laser treatment safety console (simulated rig)");
    println!();
}

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
