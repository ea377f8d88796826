//! Stand-in for the PWM controller's HTTP API, for running the client without
//! hardware. Serves `GET /cmd?name=value` and an SSE stream of `hw_app_state`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Router,
};
use pspwm_remote::config::Config;
use pspwm_remote::model::{DeviceState, FieldValue, RemoteState};
use rand::Rng;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;

const FAN_ON_TEMP: f64 = 45.0;
const FAN_OFF_TEMP: f64 = 40.0;
const AMBIENT_TEMP: f64 = 25.0;

// Commands carrying a number that is stored as is under the name minus `set_`.
const NUMERIC_SETTERS: &[&str] = &[
    "set_frequency_min",
    "set_frequency_max",
    "set_frequency_changerate",
    "set_duty_min",
    "set_duty_max",
    "set_duty_changerate",
    "set_lag_dt",
    "set_lead_dt",
    "set_current_limit",
    "set_temp_1_limit",
    "set_temp_2_limit",
    "set_oneshot_len",
];

const FLAG_SETTERS: &[&str] = &[
    "set_relay_ref_active",
    "set_relay_dut_active",
    "set_fan_override",
    "set_setpoint_throttling_enabled",
];

#[derive(Clone)]
struct Simulator {
    state: DeviceState,
    oneshot_until: Option<Instant>,
}

impl Simulator {
    fn new() -> Self {
        let mut state = DeviceState::default();
        state.apply(&patch([
            ("temp_1", FieldValue::Number(AMBIENT_TEMP)),
            ("temp_2", FieldValue::Number(AMBIENT_TEMP)),
            ("heatsink_temp", FieldValue::Number(AMBIENT_TEMP)),
            ("aux_temp", FieldValue::Number(AMBIENT_TEMP)),
            ("power_pwm_active", FieldValue::Bool(false)),
            ("drv_disabled", FieldValue::Bool(false)),
        ]));
        Self {
            state,
            oneshot_until: None,
        }
    }

    fn number(&self, name: &str) -> f64 {
        self.state.number(name).unwrap_or_default()
    }

    fn flag(&self, name: &str) -> bool {
        self.state.flag(name).unwrap_or_default()
    }

    fn command(&mut self, name: &str, value: &str, now: Instant) -> Result<(), String> {
        let parse = || match value.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(format!("{name}: invalid number {value:?}")),
        };
        let mut changes = RemoteState::new();
        match name {
            _ if NUMERIC_SETTERS.contains(&name) => {
                let key = &name["set_".len()..];
                changes.insert(key.to_string(), FieldValue::Number(parse()?));
            }
            _ if FLAG_SETTERS.contains(&name) => {
                let key = &name["set_".len()..];
                changes.insert(key.to_string(), FieldValue::Bool(value == "true"));
            }
            "set_frequency" => {
                let f = parse()?
                    .max(self.number("frequency_min"))
                    .min(self.number("frequency_max"));
                changes.insert("frequency".into(), FieldValue::Number(f));
            }
            "set_duty" => {
                let d = parse()?
                    .max(self.number("duty_min"))
                    .min(self.number("duty_max"));
                changes.insert("duty".into(), FieldValue::Number(d));
            }
            "set_power_pwm_active" => {
                let on = value == "true";
                if on && (self.flag("hw_overtemp") || self.flag("hw_oc_fault_present")) {
                    tracing::warn!("shutdown still active; output stays off");
                } else {
                    changes.insert("power_pwm_active".into(), FieldValue::Bool(on));
                }
            }
            "trigger_oneshot" => {
                let len = self.number("oneshot_len").max(0.0);
                let until = Duration::try_from_secs_f64(len)
                    .ok()
                    .and_then(|len| now.checked_add(len))
                    .ok_or_else(|| format!("{name}: oneshot length {len} out of range"))?;
                self.oneshot_until = Some(until);
                changes.insert("power_pwm_active".into(), FieldValue::Bool(true));
            }
            "clear_shutdown" => {
                let faults = [
                    "hw_overtemp",
                    "hw_oc_fault",
                    "hw_oc_fault_present",
                    "hw_oc_fault_occurred",
                ];
                for key in faults {
                    changes.insert(key.into(), FieldValue::Bool(false));
                }
            }
            "save_settings" => tracing::info!("settings saved"),
            _ => return Err(format!("unknown command: {name}")),
        }
        self.state.apply(&changes);
        self.evaluate_temperatures();
        tracing::info!(command = name, value, "command applied");
        Ok(())
    }

    /// Advances the thermal model by one push interval.
    fn tick(&mut self, now: Instant) {
        let mut changes = RemoteState::new();
        if self.oneshot_until.is_some_and(|until| now >= until) {
            self.oneshot_until = None;
            changes.insert("power_pwm_active".into(), FieldValue::Bool(false));
        }

        let load = if self.flag("power_pwm_active") {
            self.number("duty") * 0.4
        } else {
            0.0
        };
        let cooling = if self.flag("fan_active") { 0.25 } else { 0.1 };
        let mut rng = rand::thread_rng();
        let heatsink = self.number("heatsink_temp");
        let heatsink =
            heatsink + (AMBIENT_TEMP + load - heatsink) * cooling + rng.gen_range(-0.2..0.2);
        let aux = AMBIENT_TEMP + load * 0.2 + rng.gen_range(-0.1..0.1);
        for (key, value) in [
            ("heatsink_temp", heatsink),
            ("temp_1", heatsink),
            ("aux_temp", aux),
            ("temp_2", aux),
        ] {
            changes.insert(key.into(), FieldValue::Number(value));
        }
        self.state.apply(&changes);
        self.evaluate_temperatures();
    }

    fn evaluate_temperatures(&mut self) {
        let (t1, t2) = (self.number("temp_1"), self.number("temp_2"));
        let mut changes = RemoteState::new();
        if t1 > self.number("temp_1_limit") || t2 > self.number("temp_2_limit") {
            if !self.flag("hw_overtemp") {
                tracing::warn!(temp_1 = t1, temp_2 = t2, "overtemperature shutdown");
            }
            changes.insert("hw_overtemp".into(), FieldValue::Bool(true));
            changes.insert("power_pwm_active".into(), FieldValue::Bool(false));
        }
        let fan = if self.flag("fan_override") || t1.max(t2) >= FAN_ON_TEMP {
            true
        } else if t1.max(t2) < FAN_OFF_TEMP {
            false
        } else {
            self.flag("fan_active")
        };
        changes.insert("fan_active".into(), FieldValue::Bool(fan));
        self.state.apply(&changes);
    }

    fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        let snapshot: RemoteState = self
            .state
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        serde_json::to_string(&snapshot)
    }
}

fn patch<const N: usize>(entries: [(&str, FieldValue); N]) -> RemoteState {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[derive(Clone)]
struct SimState {
    sim: Arc<Mutex<Simulator>>,
    push_interval: Duration,
}

impl SimState {
    fn lock(&self) -> MutexGuard<'_, Simulator> {
        self.sim.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn cmd_handler(
    State(state): State<SimState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    if params.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing command").into_response();
    }
    let now = Instant::now();
    let mut sim = state.lock();
    // Pairs are applied to a copy so a rejected one leaves the device untouched.
    let mut staged = sim.clone();
    for (name, value) in &params {
        if let Err(err) = staged.command(name, value, now) {
            tracing::warn!(error = %err, "command rejected");
            return (StatusCode::BAD_REQUEST, err).into_response();
        }
    }
    *sim = staged;
    StatusCode::OK.into_response()
}

async fn events_handler(State(state): State<SimState>) -> impl IntoResponse {
    tracing::info!("events client connected");
    let ticker = tokio::time::interval(state.push_interval);
    let stream = futures_util::stream::unfold((ticker, state), |(mut ticker, state)| async move {
        ticker.tick().await;
        let data = state.lock().snapshot_json().unwrap_or_else(|err| {
            tracing::error!(error = %err, "snapshot encode failed");
            String::from("{}")
        });
        let event = Event::default().event("hw_app_state").data(data);
        Some((Ok::<_, Infallible>(event), (ticker, state)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn router(state: SimState) -> Router {
    Router::new()
        .route("/cmd", get(cmd_handler))
        .route("/events", get(events_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let push_interval = Duration::from_millis(config.simulator.push_interval_ms);
    let state = SimState {
        sim: Arc::new(Mutex::new(Simulator::new())),
        push_interval,
    };

    let thermal = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(push_interval);
        loop {
            ticker.tick().await;
            thermal.lock().tick(Instant::now());
        }
    });

    let addr: SocketAddr = format!("0.0.0.0:{}", config.simulator.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "device simulator listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("shutdown: ctrl-c");
        })
        .await?;
    Ok(())
}
