use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A primitive value pushed by the device for a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Number,
    Text,
}

/// One decoded push snapshot: a flat field name to value mapping.
pub type RemoteState = BTreeMap<String, FieldValue>;

pub fn decode_remote_state(payload: &str) -> Result<RemoteState, serde_json::Error> {
    serde_json::from_str(payload)
}

struct KnownField {
    name: &'static str,
    initial: Initial,
}

#[derive(Clone, Copy)]
enum Initial {
    Number(f64),
    Bool(bool),
}

const fn num(name: &'static str, v: f64) -> KnownField {
    KnownField {
        name,
        initial: Initial::Number(v),
    }
}

const fn flag(name: &'static str, v: bool) -> KnownField {
    KnownField {
        name,
        initial: Initial::Bool(v),
    }
}

// Field set reported by the device in every `hw_app_state` telegram.
const KNOWN_FIELDS: &[KnownField] = &[
    // hardware limits
    num("frequency_min_hw", 0.01),
    num("frequency_max_hw", 1000.0),
    num("dt_sum_max_hw", 600.0),
    num("duty_max_hw", 100.0),
    num("current_limit_max_hw", 100.0),
    // runtime setpoint limits
    num("frequency_min", 90.0),
    num("frequency_max", 110.0),
    num("duty_min", 0.0),
    num("duty_max", 95.0),
    // PWM setpoints
    num("frequency", 100.0),
    num("frequency_changerate", 25.0),
    num("duty", 0.0),
    num("duty_changerate", 250.0),
    num("lead_dt", 300.0),
    num("lag_dt", 300.0),
    flag("power_pwm_active", true),
    flag("setpoint_throttling_enabled", false),
    // aux hardware
    num("current_limit", 0.0),
    flag("relay_ref_active", false),
    flag("relay_dut_active", false),
    num("temp_1", 0.0),
    num("temp_2", 0.0),
    num("temp_1_limit", 50.0),
    num("temp_2_limit", 50.0),
    num("aux_temp", 0.0),
    num("heatsink_temp", 0.0),
    flag("fan_active", false),
    flag("fan_override", false),
    num("base_div", 1.0),
    num("timer_div", 1.0),
    flag("drv_supply_active", true),
    flag("drv_disabled", true),
    // latched fault flags
    flag("hw_oc_fault", false),
    flag("hw_overtemp", false),
    flag("hw_oc_fault_present", false),
    flag("hw_oc_fault_occurred", false),
    num("oneshot_len", 0.001),
];

/// Keys of a snapshot that were not adopted.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Rejected {
    pub unknown: Vec<String>,
    pub mismatched: Vec<String>,
}

impl Rejected {
    pub fn is_empty(&self) -> bool {
        self.unknown.is_empty() && self.mismatched.is_empty()
    }
}

/// Durable copy of the device state, owned by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    fields: BTreeMap<&'static str, FieldValue>,
    hw_error: String,
}

impl Default for DeviceState {
    fn default() -> Self {
        let fields = KNOWN_FIELDS
            .iter()
            .map(|f| {
                let value = match f.initial {
                    Initial::Number(v) => FieldValue::Number(v),
                    Initial::Bool(v) => FieldValue::Bool(v),
                };
                (f.name, value)
            })
            .collect();
        let mut state = Self {
            fields,
            hw_error: String::new(),
        };
        state.update_computed_values();
        state
    }
}

impl DeviceState {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_f64)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(FieldValue::as_bool)
    }

    pub fn hw_error(&self) -> &str {
        &self.hw_error
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    /// Copies every known, kind-compatible field of `remote` into this state.
    pub fn apply(&mut self, remote: &RemoteState) -> Rejected {
        let mut rejected = Rejected::default();
        for (key, value) in remote {
            match self.fields.get_mut(key.as_str()) {
                Some(slot) if slot.kind() == value.kind() => *slot = value.clone(),
                Some(_) => rejected.mismatched.push(key.clone()),
                None => rejected.unknown.push(key.clone()),
            }
        }
        self.update_computed_values();
        rejected
    }

    fn update_computed_values(&mut self) {
        let oc_fault = self.flag("hw_oc_fault").unwrap_or(false)
            || self.flag("hw_oc_fault_present").unwrap_or(false);
        let overtemp = self.flag("hw_overtemp").unwrap_or(false);
        self.hw_error = if oc_fault {
            "HW OC FAULT".to_string()
        } else if overtemp {
            "OVERTEMPERATURE".to_string()
        } else {
            String::new()
        };
    }
}
