//! `warden-cli` – Warden Command Line Interface
//!
//! This binary boots the safety core against the simulated rover.  It:
//!
//! 1. Installs logging and, when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, OTLP
//!    trace export.
//! 2. Loads `~/.warden/config.toml`, writing the defaults on first run.
//! 3. Spawns the [`ControlLoop`] and a task echoing hazard notifications and
//!    system alerts to the console.
//! 4. Drops the operator into an **interactive REPL** with slash-commands.
//! 5. Intercepts **Ctrl-C** to queue a manual emergency stop, then shuts the
//!    loop down with the drivetrain at neutral.

mod config;
mod repl;

use colored::Colorize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use warden_hal::SimRover;
use warden_middleware::{EventBus, Topic};
use warden_runtime::{ControlHandle, ControlLoop};

fn main() {
    // Hold the guard until exit so pending spans are flushed.
    let _otel_guard = warden_runtime::init_tracing("warden");

    print_banner();
    let cfg = load_or_create_config();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("warden")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    let rover = SimRover::new();
    let bus = EventBus::default();
    let shutdown = CancellationToken::new();

    let (control, handle) = ControlLoop::new(
        rover.sensors(),
        rover.drivetrain(),
        cfg.safety.clone(),
        bus.clone(),
    );
    let loop_task = runtime.spawn(control.run(shutdown.clone()));
    runtime.spawn(echo_events(bus, shutdown.clone()));

    install_ctrlc_handler(handle.clone(), shutdown.clone(), cfg.safety.poll_interval());

    println!(
        "  Rover simulated, control loop running every {} ms.",
        cfg.safety.poll_interval_ms.to_string().bold()
    );
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // The console blocks on stdin, so it gets its own thread.  When Ctrl-C
    // cancels the token first, the thread is left behind at exit.
    let session = repl::Session::new(
        runtime.handle().clone(),
        handle,
        rover,
        shutdown.clone(),
        cfg.safety.client_timeout(),
    );
    std::thread::spawn(move || repl::run(session));

    runtime.block_on(async {
        shutdown.cancelled().await;
        if let Err(e) = loop_task.await {
            error!(error = %e, "control loop task failed");
        }
    });
    println!("{}", "  ✓ Drivetrain at neutral. Exiting Warden.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// Startup
// ─────────────────────────────────────────────────────────────────────────────

fn load_or_create_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&config::Config::default()) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

/// Ctrl-C outside the console prompt (or SIGTERM): stop the rover, give the
/// loop a couple of ticks to act on it, then shut down.
fn install_ctrlc_handler(handle: ControlHandle, shutdown: CancellationToken, poll: Duration) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the rover …".yellow().bold());
        match handle.emergency_stop_now() {
            Ok(()) => println!("{}", "  ✓ Emergency stop queued.".green()),
            Err(e) => warn!(error = %e, "emergency stop was not queued"),
        }
        std::thread::sleep(poll * 2);
        shutdown.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; emergency stop on Ctrl-C will not be available");
    }
}

/// Print notifications and system alerts as they happen.
async fn echo_events(bus: EventBus, shutdown: CancellationToken) {
    let mut notes = bus.subscribe_to(Topic::Notifications);
    let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(event) = notes.next() => event,
            Some(event) = alerts.next() => event,
            else => break,
        };
        if let Some(line) = repl::describe(&event.payload) {
            println!("  {} {}", "»".dimmed(), line);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#" _      __            __         "#.bold().cyan());
    println!("{}", r#"| | /| / /__ _________/ /__ ___  "#.bold().cyan());
    println!("{}", r#"| |/ |/ / _ `/ __/ _  / -_) _ \ "#.bold().cyan());
    println!("{}", r#"|__/|__/\_,_/_/  \_,_/\__/_//_/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Warden".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot safety and motion authority");
    println!();
}
