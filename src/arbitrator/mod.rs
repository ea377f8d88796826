//! Arbitration between values the user is entering and values pushed by the
//! device for the same fields.
//!
//! Continuous controls (sliders) are held individually while dragged and
//! released after a grace delay, so a snapshot that was already in flight does
//! not make the knob jump back. Editing any discrete field freezes the whole
//! view until the form is submitted or a confirm key is pressed on a field.

use crate::dispatch::Command;
use crate::model::{FieldValue, RemoteState};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Read-only display of a remote value.
    Indicator,
    /// Switch that only requests a change; it flips when the device reports it.
    Toggle,
    /// Free-form input that freezes the view while edited.
    Discrete,
    /// Slider held individually while dragged.
    Continuous,
}

/// A view field the arbitrator can read, write and enable.
pub trait ControllableField: Send {
    fn id(&self) -> &str;
    fn kind(&self) -> FieldKind;
    fn current_value(&self) -> &str;
    fn set_value(&mut self, value: String);
    fn disabled(&self) -> bool;
    fn set_disabled(&mut self, disabled: bool);
    fn is_dirty(&self) -> bool;
    fn set_dirty(&mut self, dirty: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Fixed(usize),
    Toggle,
    Text,
}

impl ValueFormat {
    pub fn render(&self, value: &FieldValue) -> Option<String> {
        match (self, value) {
            (Self::Fixed(decimals), FieldValue::Number(v)) => Some(format!("{v:.decimals$}")),
            (Self::Toggle, FieldValue::Bool(v)) => Some(v.to_string()),
            (Self::Text, v) => Some(v.to_string()),
            _ => None,
        }
    }
}

/// Where a field's value comes from and which command an edit sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub state_key: &'static str,
    pub format: ValueFormat,
    pub command: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Held,
    Releasing(Instant),
}

struct Tracked {
    field: Box<dyn ControllableField>,
    binding: Binding,
}

pub struct EditArbitrator {
    fields: Vec<Tracked>,
    global_suppressed: bool,
    dirty: BTreeSet<usize>,
    holds: HashMap<usize, Hold>,
    release_grace: Duration,
    latest: Option<RemoteState>,
}

impl EditArbitrator {
    pub fn new(release_grace: Duration) -> Self {
        Self {
            fields: Vec::new(),
            global_suppressed: false,
            dirty: BTreeSet::new(),
            holds: HashMap::new(),
            release_grace,
            latest: None,
        }
    }

    pub fn track(&mut self, field: impl ControllableField + 'static, binding: Binding) {
        self.fields.push(Tracked {
            field: Box::new(field),
            binding,
        });
    }

    pub fn fields(&self) -> impl Iterator<Item = (&dyn ControllableField, &Binding)> {
        self.fields
            .iter()
            .map(|t| (t.field.as_ref() as &dyn ControllableField, &t.binding))
    }

    pub fn is_globally_suppressed(&self) -> bool {
        self.global_suppressed
    }

    /// Edit start or continuation. Returns the command the edit should send.
    pub fn on_input(&mut self, id: &str, value: &str, _now: Instant) -> Option<Command> {
        let idx = self.index_of(id)?;
        let tracked = &mut self.fields[idx];
        if tracked.field.disabled() {
            tracing::debug!(field = id, "ignoring input on disabled field");
            return None;
        }
        match tracked.field.kind() {
            FieldKind::Indicator => return None,
            FieldKind::Toggle => {}
            FieldKind::Continuous => {
                tracked.field.set_value(value.to_string());
                self.holds.insert(idx, Hold::Held);
            }
            FieldKind::Discrete => {
                tracked.field.set_value(value.to_string());
                tracked.field.set_dirty(true);
                self.dirty.insert(idx);
                if !self.global_suppressed {
                    tracing::debug!(field = id, "view updates suppressed while editing");
                }
                self.global_suppressed = true;
            }
        }
        tracked
            .binding
            .command
            .map(|name| Command::new(name, Some(value.to_string())))
    }

    /// Confirm key on a field. On a slider this is a release; anywhere else it
    /// ends the form edit.
    pub fn on_confirm(&mut self, id: &str, now: Instant) {
        match self.index_of(id) {
            Some(idx) if self.fields[idx].field.kind() == FieldKind::Continuous => {
                self.on_release(id, now)
            }
            _ => self.clear_edits(),
        }
    }

    pub fn on_submit(&mut self) {
        self.clear_edits();
    }

    /// Slider released. Remote updates resume once the grace delay elapsed.
    pub fn on_release(&mut self, id: &str, now: Instant) {
        let Some(idx) = self.index_of(id) else {
            return;
        };
        if let Some(hold) = self.holds.get_mut(&idx) {
            *hold = Hold::Releasing(now + self.release_grace);
        }
    }

    pub fn update(&mut self, remote: &RemoteState, now: Instant) {
        self.latest = Some(remote.clone());
        if self.global_suppressed {
            return;
        }
        for idx in 0..self.fields.len() {
            if self.slider_held(idx, now) {
                continue;
            }
            self.apply_latest(idx);
        }
    }

    /// Releases sliders whose grace delay elapsed, rendering the most recent
    /// snapshot into them. Returns the next pending release deadline.
    pub fn poll(&mut self, now: Instant) -> Option<Instant> {
        let due: Vec<usize> = self
            .holds
            .iter()
            .filter_map(|(idx, hold)| match hold {
                Hold::Releasing(at) if *at <= now => Some(*idx),
                _ => None,
            })
            .collect();
        for idx in due {
            self.holds.remove(&idx);
            if !self.global_suppressed {
                self.apply_latest(idx);
            }
        }
        self.holds
            .values()
            .filter_map(|hold| match hold {
                Hold::Releasing(at) => Some(*at),
                Hold::Held => None,
            })
            .min()
    }

    pub fn is_suppressed(&self, id: &str, now: Instant) -> bool {
        if self.global_suppressed {
            return true;
        }
        self.index_of(id)
            .map(|idx| self.slider_held(idx, now))
            .unwrap_or(false)
    }

    /// Enables or disables every field following the link liveness.
    pub fn set_connected(&mut self, connected: bool) {
        for tracked in &mut self.fields {
            tracked.field.set_disabled(!connected);
            if !connected && tracked.field.kind() == FieldKind::Indicator {
                tracked.field.set_value("unknown".to_string());
            }
        }
        if connected && !self.global_suppressed {
            for idx in 0..self.fields.len() {
                if self.fields[idx].field.kind() == FieldKind::Indicator {
                    self.apply_latest(idx);
                }
            }
        }
    }

    fn clear_edits(&mut self) {
        if self.global_suppressed {
            tracing::debug!(fields = self.dirty.len(), "view updates allowed again");
        }
        self.global_suppressed = false;
        for idx in std::mem::take(&mut self.dirty) {
            self.fields[idx].field.set_dirty(false);
        }
    }

    fn slider_held(&self, idx: usize, now: Instant) -> bool {
        match self.holds.get(&idx) {
            Some(Hold::Held) => true,
            Some(Hold::Releasing(at)) => *at > now,
            None => false,
        }
    }

    fn apply_latest(&mut self, idx: usize) {
        let Some(latest) = self.latest.as_ref() else {
            return;
        };
        let tracked = &mut self.fields[idx];
        let rendered = latest
            .get(tracked.binding.state_key)
            .and_then(|value| tracked.binding.format.render(value));
        if let Some(rendered) = rendered {
            tracked.field.set_value(rendered);
        }
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.fields.iter().position(|t| t.field.id() == id)
    }
}
