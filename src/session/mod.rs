//! Headless session: the single owner of device state and the view.
//!
//! Snapshots, liveness transitions and console input all arrive as
//! [`SessionEvent`]s on one channel, so state is only ever mutated here.

use crate::arbitrator::{ControllableField, EditArbitrator};
use crate::channel::StateChannel;
use crate::dispatch::{Command, CommandDispatcher};
use crate::model::{DeviceState, RemoteState};
use crate::watchdog::WatchdogStatus;
use std::fmt::Write as _;
use std::future::pending;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum EditSignal {
    Input { field: String, value: String },
    Release { field: String },
    Confirm { field: String },
    Submit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Snapshot(RemoteState),
    Liveness(WatchdogStatus),
    Edit(EditSignal),
    /// Button-style command sent as is, without touching edit state.
    Command(Command),
    Show,
    Debug(bool),
    Quit,
}

pub const CONSOLE_HELP: &str = "\
commands:
  input <field> <value>   edit a field (sends its command)
  release <field>         release a slider
  confirm <field>         confirm key on a field
  submit                  submit the form
  cmd <name> [value]      send a raw device command
  show                    print device state and view
  debug on|off            suspend/resume reconnect and watchdog
  quit";

pub fn parse_console_line(line: &str) -> Result<Option<SessionEvent>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let mut arg = |what: &str| {
        words
            .next()
            .map(str::to_string)
            .ok_or_else(|| format!("{verb}: missing {what}"))
    };
    let event = match verb {
        "input" => {
            let field = arg("field")?;
            let value = arg("value")?;
            SessionEvent::Edit(EditSignal::Input { field, value })
        }
        "release" => SessionEvent::Edit(EditSignal::Release {
            field: arg("field")?,
        }),
        "confirm" => SessionEvent::Edit(EditSignal::Confirm {
            field: arg("field")?,
        }),
        "submit" => SessionEvent::Edit(EditSignal::Submit),
        "cmd" => {
            let name = arg("name")?;
            SessionEvent::Command(Command::new(name, arg("value").ok()))
        }
        "show" => SessionEvent::Show,
        "debug" => match arg("on|off")?.as_str() {
            "on" => SessionEvent::Debug(true),
            "off" => SessionEvent::Debug(false),
            other => return Err(format!("debug: expected on or off, got {other}")),
        },
        "quit" | "exit" => SessionEvent::Quit,
        other => return Err(format!("unknown command: {other}")),
    };
    Ok(Some(event))
}

pub struct Session {
    state: DeviceState,
    arbitrator: EditArbitrator,
    dispatcher: CommandDispatcher,
    channel: Option<StateChannel>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    connected: bool,
}

impl Session {
    pub fn new(
        mut arbitrator: EditArbitrator,
        dispatcher: CommandDispatcher,
        channel: Option<StateChannel>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        // Nothing is known about the link until the first snapshot.
        arbitrator.set_connected(false);
        Self {
            state: DeviceState::default(),
            arbitrator,
            dispatcher,
            channel,
            events,
            connected: false,
        }
    }

    pub async fn run(&mut self) {
        loop {
            let release_at = self.arbitrator.poll(Instant::now());
            let release = async move {
                match release_at {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if !self.handle(event, Instant::now()) {
                        break;
                    }
                }
                _ = release => {}
            }
        }
        tracing::info!("session ended");
    }

    /// Returns false once the session should end.
    pub fn handle(&mut self, event: SessionEvent, now: Instant) -> bool {
        match event {
            SessionEvent::Snapshot(remote) => {
                let rejected = self.state.apply(&remote);
                if !rejected.is_empty() {
                    tracing::debug!(
                        unknown = ?rejected.unknown,
                        mismatched = ?rejected.mismatched,
                        "snapshot keys not adopted"
                    );
                }
                self.arbitrator.update(&remote, now);
            }
            SessionEvent::Liveness(status) => {
                self.connected = status == WatchdogStatus::Alive;
                self.arbitrator.set_connected(self.connected);
                if self.connected {
                    tracing::info!("connection to hardware ok");
                } else {
                    tracing::warn!("no connection to hardware");
                }
            }
            SessionEvent::Edit(signal) => self.on_edit(signal, now),
            SessionEvent::Command(command) => {
                if self.connected {
                    self.dispatcher.submit(command);
                } else {
                    tracing::warn!(command = %command, "not connected; command dropped");
                }
            }
            SessionEvent::Show => println!("{}", self.render(now)),
            SessionEvent::Debug(on) => match (&self.channel, on) {
                (Some(channel), true) => channel.suspend(),
                (Some(channel), false) => channel.resume(),
                (None, _) => tracing::warn!("no state channel attached"),
            },
            SessionEvent::Quit => return false,
        }
        true
    }

    fn on_edit(&mut self, signal: EditSignal, now: Instant) {
        match signal {
            EditSignal::Input { field, value } => {
                match self.arbitrator.on_input(&field, &value, now) {
                    Some(command) => self.dispatcher.submit(command),
                    None => tracing::debug!(field = %field, "input produced no command"),
                }
            }
            EditSignal::Release { field } => self.arbitrator.on_release(&field, now),
            EditSignal::Confirm { field } => self.arbitrator.on_confirm(&field, now),
            EditSignal::Submit => self.arbitrator.on_submit(),
        }
    }

    pub fn render(&self, now: Instant) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "connection: {}",
            if self.connected { "OK" } else { "no connection to hardware" }
        );
        if !self.state.hw_error().is_empty() {
            let _ = writeln!(out, "error: {}", self.state.hw_error());
        }
        if let Some(channel) = &self.channel {
            let status = channel.status();
            let _ = writeln!(
                out,
                "events: {:?} attempts={} snapshots={} malformed={}{}",
                status.state,
                status.connect_attempts,
                status.snapshots,
                status.malformed,
                if status.suspended { " (debug)" } else { "" }
            );
        }
        out.push_str("view:\n");
        for (field, _) in self.arbitrator.fields() {
            let mut flags = Vec::new();
            if field.disabled() {
                flags.push("disabled");
            }
            if field.is_dirty() {
                flags.push("editing");
            }
            if self.arbitrator.is_suppressed(field.id(), now) {
                flags.push("held");
            }
            let _ = writeln!(
                out,
                "  {:<18} {:<10} {}",
                field.id(),
                field.current_value(),
                flags.join(",")
            );
        }
        out.push_str("state:\n");
        for (name, value) in self.state.iter() {
            let _ = writeln!(out, "  {name} = {value}");
        }
        out
    }
}
