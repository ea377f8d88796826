use crate::arbitrator::{Binding, ControllableField, FieldKind, ValueFormat};

/// Headless field: holds the rendered text and the flags a widget would carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldModel {
    id: String,
    kind: FieldKind,
    value: String,
    disabled: bool,
    dirty: bool,
}

impl FieldModel {
    pub fn new(id: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            id: id.into(),
            kind,
            value: String::new(),
            disabled: false,
            dirty: false,
        }
    }
}

impl ControllableField for FieldModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> FieldKind {
        self.kind
    }

    fn current_value(&self) -> &str {
        &self.value
    }

    fn set_value(&mut self, value: String) {
        self.value = value;
    }

    fn disabled(&self) -> bool {
        self.disabled
    }

    fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}

fn field(
    id: &str,
    kind: FieldKind,
    state_key: &'static str,
    format: ValueFormat,
    command: Option<&'static str>,
) -> (FieldModel, Binding) {
    (
        FieldModel::new(id, kind),
        Binding {
            state_key,
            format,
            command,
        },
    )
}

/// The device control page: status indicators, switches, operating settings
/// and the frequency/duty setpoints as number entry plus slider.
pub fn standard_layout() -> Vec<(FieldModel, Binding)> {
    use FieldKind::*;
    vec![
        field(
            "power_pwm",
            Toggle,
            "power_pwm_active",
            ValueFormat::Toggle,
            Some("set_power_pwm_active"),
        ),
        field("shutdown", Indicator, "hw_oc_fault_present", ValueFormat::Toggle, None),
        field("aux_temp", Indicator, "aux_temp", ValueFormat::Fixed(1), None),
        field("heatsink_temp", Indicator, "heatsink_temp", ValueFormat::Fixed(1), None),
        field("fan", Toggle, "fan_active", ValueFormat::Toggle, Some("set_fan_override")),
        field(
            "relay_ref",
            Toggle,
            "relay_ref_active",
            ValueFormat::Toggle,
            Some("set_relay_ref_active"),
        ),
        field(
            "relay_dut",
            Toggle,
            "relay_dut_active",
            ValueFormat::Toggle,
            Some("set_relay_dut_active"),
        ),
        field("lead_dt", Discrete, "lead_dt", ValueFormat::Fixed(0), Some("set_lead_dt")),
        field("lag_dt", Discrete, "lag_dt", ValueFormat::Fixed(0), Some("set_lag_dt")),
        field(
            "current_limit",
            Discrete,
            "current_limit",
            ValueFormat::Fixed(1),
            Some("set_current_limit"),
        ),
        field(
            "frequency_number",
            Discrete,
            "frequency",
            ValueFormat::Fixed(1),
            Some("set_frequency"),
        ),
        field(
            "frequency_range",
            Continuous,
            "frequency",
            ValueFormat::Fixed(1),
            Some("set_frequency"),
        ),
        field("duty_number", Discrete, "duty", ValueFormat::Fixed(1), Some("set_duty")),
        field("duty_range", Continuous, "duty", ValueFormat::Fixed(1), Some("set_duty")),
    ]
}
