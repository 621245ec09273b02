//! REPL – the operator console for a running safety loop.
//!
//! Stands in for a real transport: every command becomes a
//! [`ControlHandle`] call, and the simulated-world commands poke the
//! [`SimRover`] directly so hazards can be provoked by hand.
//!
//! Supported slash-commands:
//!   /help                – show this list
//!   /connect             – open the operator link (with keep-alive pings)
//!   /disconnect          – drop the operator link
//!   /drive <speed> <turn>– send a motion intent, both in [-1, 1]
//!   /mode <name>         – request a mode; special modes toggle
//!   /stop  /clear        – manual emergency stop / clear it
//!   /obstacle <cm>       – move the simulated obstacle
//!   /cliff on|off        – put the rover over an edge, or back
//!   /battery <volts>     – set the simulated pack voltage
//!   /status              – print the latest telemetry
//!   /quit | /exit        – stop the rover and exit

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use warden_hal::SimRover;
use warden_runtime::ControlHandle;
use warden_types::{
    EventPayload, HazardKind, IntentSource, MotionIntent, NotificationPhase, RobotMode,
    TelemetrySnapshot, WardenError,
};

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Help,
    Connect,
    Disconnect,
    Drive { speed: f32, turn: f32 },
    Mode(RobotMode),
    Stop,
    Clear,
    Obstacle(f32),
    Cliff(bool),
    Battery(f32),
    Status,
    Quit,
}

/// Parse a console line.  The error is a message for the operator.
pub fn parse(line: &str) -> Result<ReplCommand, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    let cmd = match (head, args.as_slice()) {
        ("/help", []) => ReplCommand::Help,
        ("/connect", []) => ReplCommand::Connect,
        ("/disconnect", []) => ReplCommand::Disconnect,
        ("/drive", [speed]) => ReplCommand::Drive {
            speed: number(speed)?,
            turn: 0.0,
        },
        ("/drive", [speed, turn]) => ReplCommand::Drive {
            speed: number(speed)?,
            turn: number(turn)?,
        },
        ("/mode", [name]) => ReplCommand::Mode(name.parse().map_err(|e: WardenError| e.to_string())?),
        ("/stop", []) => ReplCommand::Stop,
        ("/clear", []) => ReplCommand::Clear,
        ("/obstacle", [cm]) => ReplCommand::Obstacle(number(cm)?),
        ("/cliff", ["on"]) => ReplCommand::Cliff(true),
        ("/cliff", ["off"]) => ReplCommand::Cliff(false),
        ("/battery", [volts]) => ReplCommand::Battery(number(volts)?),
        ("/status", []) => ReplCommand::Status,
        ("/quit" | "/exit", []) => ReplCommand::Quit,
        (
            "/help" | "/connect" | "/disconnect" | "/drive" | "/mode" | "/stop" | "/clear"
            | "/obstacle" | "/cliff" | "/battery" | "/status" | "/quit" | "/exit",
            _,
        ) => return Err(format!("bad arguments for {head}, see /help")),
        (other, _) => return Err(format!("unknown command '{other}'")),
    };
    Ok(cmd)
}

fn number(raw: &str) -> Result<f32, String> {
    raw.parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("'{raw}' is not a number"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Whether the console keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// State of one console session.
pub struct Session {
    rt: Handle,
    control: ControlHandle,
    rover: SimRover,
    shutdown: CancellationToken,
    /// Cancels the keep-alive task while connected.
    heartbeat: Option<CancellationToken>,
    heartbeat_period: Duration,
}

impl Session {
    /// `client_timeout` sizes the keep-alive so a connected console never
    /// looks stale to the liveness tracker.
    pub fn new(
        rt: Handle,
        control: ControlHandle,
        rover: SimRover,
        shutdown: CancellationToken,
        client_timeout: Duration,
    ) -> Self {
        Self {
            rt,
            control,
            rover,
            shutdown,
            heartbeat: None,
            heartbeat_period: (client_timeout / 3).max(Duration::from_millis(100)),
        }
    }

    fn execute(&mut self, cmd: ReplCommand) -> Result<Flow, WardenError> {
        match cmd {
            ReplCommand::Help => cmd_help(),
            ReplCommand::Connect => self.connect()?,
            ReplCommand::Disconnect => self.disconnect()?,
            ReplCommand::Drive { speed, turn } => {
                let intent = MotionIntent::new(speed, turn, IntentSource::Operator);
                self.rt.block_on(self.control.send_intent(intent))?;
            }
            ReplCommand::Mode(target) => {
                let mode = if target.is_special() {
                    self.rt.block_on(self.control.toggle_mode(target))?
                } else {
                    self.rt.block_on(self.control.request_mode(target))?
                };
                println!("  mode is now {}", mode.to_string().bold());
            }
            ReplCommand::Stop => {
                self.rt
                    .block_on(self.control.trigger_emergency(HazardKind::ManualStop))?;
            }
            ReplCommand::Clear => self.rt.block_on(self.control.clear_emergency())?,
            ReplCommand::Obstacle(cm) => self.rover.set_distance(cm),
            ReplCommand::Cliff(over_edge) => self.rover.set_cliff(over_edge),
            ReplCommand::Battery(volts) => self.rover.set_battery_voltage(volts),
            ReplCommand::Status => {
                let status = self.rt.block_on(self.control.status())?;
                print_status(&status);
            }
            ReplCommand::Quit => {
                self.stop_heartbeat();
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    fn connect(&mut self) -> Result<(), WardenError> {
        self.rt.block_on(self.control.connect())?;
        if self.heartbeat.is_none() {
            let stop = CancellationToken::new();
            self.rt.spawn(keep_alive(
                self.control.clone(),
                self.heartbeat_period,
                stop.clone(),
            ));
            self.heartbeat = Some(stop);
        }
        println!("  {}", "operator link up".green());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), WardenError> {
        self.stop_heartbeat();
        self.rt.block_on(self.control.disconnect())?;
        println!("  {}", "operator link down".yellow());
        Ok(())
    }

    fn stop_heartbeat(&mut self) {
        if let Some(stop) = self.heartbeat.take() {
            stop.cancel();
        }
    }
}

async fn keep_alive(control: ControlHandle, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if control.ping().await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Entry point for the interactive console.  Returns once the operator
/// quits, stdin closes, or `shutdown` fires; `shutdown` is cancelled on the
/// way out.
pub fn run(mut session: Session) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Console unavailable".red(), e);
            session.shutdown.cancel();
            return;
        }
    };

    while !session.shutdown.is_cancelled() {
        let line = match editor.readline(&format!("{} ", "warden>".bold().cyan())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                // The terminal is in raw mode, so Ctrl-C arrives here rather
                // than as a signal.
                println!("{}", "⚠  Ctrl-C – emergency stop".yellow().bold());
                if let Err(e) = session.execute(ReplCommand::Stop) {
                    warn!(error = %e, "emergency stop was not delivered");
                }
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match parse(line) {
            Ok(cmd) => match session.execute(cmd) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(e) => println!("  {} {}", "✗".red(), e),
            },
            Err(msg) => println!(
                "  {} {}. Type {} for available commands.",
                "✗".red(),
                msg,
                "/help".bold()
            ),
        }
    }

    session.stop_heartbeat();
    println!("{}", "Goodbye.".green());
    session.shutdown.cancel();
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Warden Commands".bold().underline());
    println!("  {}              – open the operator link", "/connect".bold().cyan());
    println!("  {}           – drop the operator link", "/disconnect".bold().cyan());
    println!("  {}  – drive; speed and turn in [-1, 1]", "/drive <speed> <turn>".bold().cyan());
    println!("  {}          – manual, gpt, circuit, demo, tracking", "/mode <name>".bold().cyan());
    println!("  {}         – emergency stop / release it", "/stop  /clear".bold().cyan());
    println!("  {}        – simulated obstacle distance", "/obstacle <cm>".bold().cyan());
    println!("  {}         – simulated edge under the rover", "/cliff on|off".bold().cyan());
    println!("  {}     – simulated pack voltage", "/battery <volts>".bold().cyan());
    println!("  {}               – latest telemetry", "/status".bold().cyan());
    println!("  {}         – stop the rover and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn print_status(t: &TelemetrySnapshot) {
    let emergency = t
        .active_emergency
        .map(|kind| kind.to_string().red().bold().to_string())
        .unwrap_or_else(|| "none".green().to_string());
    println!("{}", "Status".bold().underline());
    println!("  mode         : {}", t.mode.to_string().bold());
    println!("  emergency    : {emergency}");
    println!("  distance     : {:.1} cm", t.distance_cm);
    println!("  battery      : {:.0} %", t.battery_pct);
    println!("  speed / turn : {:+.2} / {:+.2}", t.speed, t.turn);
    println!("  acceleration : {:+.2} /s", t.acceleration);
    println!(
        "  safety       : collision={} edge={} auto_stop={}",
        t.safety_flags.collision_avoidance, t.safety_flags.edge_detection, t.safety_flags.auto_stop
    );
}

/// One console line for an alert or notification.  `None` for telemetry.
pub fn describe(payload: &EventPayload) -> Option<String> {
    match payload {
        EventPayload::Notification(n) => Some(match n.phase {
            NotificationPhase::Activated => format!("⚠  {} ({})", n.kind, n.message_key),
            NotificationPhase::Cleared => format!("✓  {} cleared ({})", n.kind, n.message_key),
        }),
        EventPayload::ModeChanged { from, to } => Some(format!("mode {from} → {to}")),
        EventPayload::HardwareFault { component, message } => {
            Some(format!("fault in {component}: {message}"))
        }
        EventPayload::Telemetry(_) => None,
    }
}
