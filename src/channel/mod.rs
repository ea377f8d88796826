//! Self-healing push subscription to the device's `/events` stream.
//!
//! The channel owns at most one subscription at a time. Every message of the
//! configured event name resets the liveness watchdog and is handed to the
//! state sink; any transport failure drops the subscription and schedules a
//! reconnect after a fixed delay. Retries are unbounded.

use crate::config::{DeviceConfig, TimingConfig};
use crate::dispatch::join_endpoint;
use crate::model::{decode_remote_state, RemoteState};
use crate::sse::{SseDecoder, SseError, SseEvent};
use crate::watchdog::LivenessWatchdog;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::future::pending;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Receives each decoded snapshot. The channel keeps no copy.
pub type StateSink = Box<dyn FnMut(RemoteState) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub suspended: bool,
    pub connect_attempts: u64,
    pub snapshots: u64,
    pub malformed: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub enum ChannelError {
    Url(String),
    Http(reqwest::Error),
    Status(StatusCode),
    Protocol(SseError),
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Status(status) => {
                write!(f, "subscription refused with status {}", status.as_u16())
            }
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
            Self::Closed => f.write_str("event stream closed by server"),
        }
    }
}

impl std::error::Error for ChannelError {}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub events_url: Url,
    pub state_event: String,
    pub reconnect_delay: Duration,
}

impl ChannelSettings {
    pub fn new(
        base_url: &str,
        events_path: &str,
        state_event: impl Into<String>,
        reconnect_delay: Duration,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            events_url: join_endpoint(base_url, events_path).map_err(ChannelError::Url)?,
            state_event: state_event.into(),
            reconnect_delay,
        })
    }

    pub fn from_config(device: &DeviceConfig, timing: &TimingConfig) -> Result<Self, ChannelError> {
        Self::new(
            &device.base_url,
            &device.events_path,
            device.state_event.clone(),
            timing.reconnect_delay(),
        )
    }
}

#[derive(Debug)]
enum Control {
    Suspend,
    Resume,
    Shutdown,
}

/// What the run loop does after a connection attempt ends.
enum Flow {
    Lost(ChannelError),
    Reconnect,
    Stop,
}

/// Handle to a running state channel.
#[derive(Clone, Debug)]
pub struct StateChannel {
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<ChannelStatus>,
}

impl StateChannel {
    pub fn spawn(
        settings: ChannelSettings,
        http: Client,
        watchdog: LivenessWatchdog,
        sink: StateSink,
    ) -> (Self, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::default());
        let task = ChannelTask {
            settings,
            http,
            watchdog,
            sink,
            control: control_rx,
            status: status_tx,
            suspended: false,
        };
        let handle = tokio::spawn(task.run());
        (
            Self {
                control: control_tx,
                status: status_rx,
            },
            handle,
        )
    }

    /// Stops reconnecting and takes the watchdog out of the loop, for manual
    /// inspection. Snapshots still reach the sink while a subscription is open.
    pub fn suspend(&self) {
        let _ = self.control.send(Control::Suspend);
    }

    /// Re-enables the watchdog and reconnects right away.
    pub fn resume(&self) {
        let _ = self.control.send(Control::Resume);
    }

    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }
}

struct ChannelTask {
    settings: ChannelSettings,
    http: Client,
    watchdog: LivenessWatchdog,
    sink: StateSink,
    control: mpsc::UnboundedReceiver<Control>,
    status: watch::Sender<ChannelStatus>,
    suspended: bool,
}

impl ChannelTask {
    async fn run(mut self) {
        loop {
            match self.connect_and_stream().await {
                Flow::Stop => break,
                Flow::Reconnect => {
                    self.set_state(ConnectionState::Disconnected);
                    tracing::info!(url = %self.settings.events_url, "reconnecting events");
                }
                Flow::Lost(err) => {
                    tracing::warn!(error = %err, "events disconnected");
                    self.status.send_modify(|s| {
                        s.state = ConnectionState::Disconnected;
                        s.last_error = Some(err.to_string());
                    });
                    if !self.wait_before_reconnect().await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("state channel stopped");
    }

    async fn connect_and_stream(&mut self) -> Flow {
        self.status.send_modify(|s| {
            s.state = ConnectionState::Connecting;
            s.connect_attempts += 1;
        });
        tracing::debug!(url = %self.settings.events_url, "connecting events");

        let request = self
            .http
            .get(self.settings.events_url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send();
        tokio::pin!(request);

        let response = loop {
            tokio::select! {
                res = &mut request => break res,
                ctl = self.control.recv() => {
                    if let Some(flow) = self.on_control(ctl) {
                        return flow;
                    }
                }
            }
        };

        let response = match response {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => return Flow::Lost(ChannelError::Status(resp.status())),
            Err(err) => return Flow::Lost(ChannelError::Http(err)),
        };

        self.set_state(ConnectionState::Open);
        tracing::info!(url = %self.settings.events_url, "events connected");

        let mut decoder = SseDecoder::new();
        let mut retry_hint = None;
        let stream = response.bytes_stream();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                chunk = stream.next() => {
                    let bytes = match chunk {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(err)) => return Flow::Lost(ChannelError::Http(err)),
                        None => return Flow::Lost(ChannelError::Closed),
                    };
                    let events = match decoder.push(&bytes) {
                        Ok(events) => events,
                        Err(err) => return Flow::Lost(ChannelError::Protocol(err)),
                    };
                    if decoder.retry_hint_ms() != retry_hint {
                        retry_hint = decoder.retry_hint_ms();
                        tracing::debug!(
                            retry_ms = ?retry_hint,
                            reconnect_delay_ms = self.settings.reconnect_delay.as_millis() as u64,
                            "server retry hint received; reconnect delay stays fixed"
                        );
                    }
                    for event in events {
                        self.handle_event(event);
                    }
                }
                ctl = self.control.recv() => {
                    if let Some(flow) = self.on_control(ctl) {
                        return flow;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: SseEvent) {
        if event.event != self.settings.state_event {
            tracing::debug!(event = %event.event, "ignoring event");
            return;
        }
        // The telegram is periodic, so any arrival counts as a heartbeat,
        // even one whose payload turns out to be unusable.
        if !self.suspended {
            self.watchdog.reset();
        }
        match decode_remote_state(&event.data) {
            Ok(state) => {
                self.status.send_modify(|s| s.snapshots += 1);
                (self.sink)(state);
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    len = event.data.len(),
                    "skipping malformed state snapshot"
                );
                self.status.send_modify(|s| s.malformed += 1);
            }
        }
    }

    /// Returns a flow when the control message ends the current phase.
    fn on_control(&mut self, ctl: Option<Control>) -> Option<Flow> {
        match ctl {
            None | Some(Control::Shutdown) => Some(Flow::Stop),
            Some(Control::Suspend) => {
                if !self.suspended {
                    tracing::info!("reconnect and watchdog suspended");
                    self.suspended = true;
                    self.watchdog.disable();
                    self.status.send_modify(|s| s.suspended = true);
                }
                None
            }
            Some(Control::Resume) => {
                if !self.suspended {
                    return None;
                }
                tracing::info!("reconnect and watchdog resumed");
                self.suspended = false;
                self.watchdog.enable();
                self.status.send_modify(|s| s.suspended = false);
                Some(Flow::Reconnect)
            }
        }
    }

    /// Waits out the reconnect delay. Returns false when the channel must stop.
    async fn wait_before_reconnect(&mut self) -> bool {
        let deadline = Instant::now() + self.settings.reconnect_delay;
        loop {
            let suspended = self.suspended;
            let timer = async move {
                if suspended {
                    pending::<()>().await
                } else {
                    sleep_until(deadline).await
                }
            };
            tokio::select! {
                _ = timer => return true,
                ctl = self.control.recv() => match self.on_control(ctl) {
                    Some(Flow::Stop) => return false,
                    Some(_) => return true,
                    None => {}
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| s.state = state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldValue;
    use crate::watchdog::{LivenessHook, WatchdogStatus};
    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::sse::{Event, Sse};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    enum Script {
        // Each subscription receives these (event, data) pairs, then the stream ends.
        Finite(Vec<(&'static str, String)>),
        // Each subscription receives a snapshot every 20 ms until dropped.
        Endless,
        Unavailable,
    }

    struct TestDevice {
        script: Script,
        accepted: Mutex<Vec<std::time::Instant>>,
        open: AtomicUsize,
        max_open: AtomicUsize,
    }

    struct OpenGuard(Arc<TestDevice>);

    impl OpenGuard {
        fn new(device: Arc<TestDevice>) -> Self {
            let now_open = device.open.fetch_add(1, Ordering::SeqCst) + 1;
            device.max_open.fetch_max(now_open, Ordering::SeqCst);
            Self(device)
        }
    }

    impl Drop for OpenGuard {
        fn drop(&mut self) {
            self.0.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn events(State(device): State<Arc<TestDevice>>) -> Response {
        device.accepted.lock().unwrap().push(std::time::Instant::now());
        match &device.script {
            Script::Unavailable => AxumStatus::SERVICE_UNAVAILABLE.into_response(),
            Script::Finite(items) => {
                let guard = OpenGuard::new(device.clone());
                let events: Vec<Event> = items
                    .iter()
                    .map(|(name, data)| Event::default().event(*name).data(data))
                    .collect();
                let stream = futures_util::stream::unfold(
                    (events.into_iter(), guard),
                    |(mut it, guard)| async move {
                        it.next()
                            .map(|ev| (Ok::<_, Infallible>(ev), (it, guard)))
                    },
                );
                Sse::new(stream).into_response()
            }
            Script::Endless => {
                let guard = OpenGuard::new(device.clone());
                let stream = futures_util::stream::unfold((0u64, guard), |(n, guard)| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let ev = Event::default()
                        .event("hw_app_state")
                        .data(format!("{{\"duty\": {n}}}"));
                    Some((Ok::<_, Infallible>(ev), (n + 1, guard)))
                });
                Sse::new(stream).into_response()
            }
        }
    }

    async fn spawn_device(script: Script) -> (String, Arc<TestDevice>) {
        let device = Arc::new(TestDevice {
            script,
            accepted: Mutex::new(Vec::new()),
            open: AtomicUsize::new(0),
            max_open: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route("/events", get(events))
            .with_state(device.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), device)
    }

    fn watchdog() -> (LivenessWatchdog, Arc<Mutex<Vec<WatchdogStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook: LivenessHook = Arc::new(move |status| sink.lock().unwrap().push(status));
        (LivenessWatchdog::new(Duration::from_secs(30), hook), seen)
    }

    fn collecting_sink() -> (StateSink, Arc<Mutex<Vec<RemoteState>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_received = received.clone();
        let sink: StateSink = Box::new(move |state| sink_received.lock().unwrap().push(state));
        (sink, received)
    }

    async fn wait_until<F>(channel: &StateChannel, predicate: F) -> ChannelStatus
    where
        F: FnMut(&ChannelStatus) -> bool,
    {
        let mut rx = channel.subscribe();
        let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("channel status condition not reached")
            .unwrap()
            .clone();
        status
    }

    fn settings(base: &str, reconnect_ms: u64) -> ChannelSettings {
        ChannelSettings::new(
            base,
            "/events",
            "hw_app_state",
            Duration::from_millis(reconnect_ms),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn snapshot_reaches_sink_and_resets_watchdog() {
        let (base, _device) = spawn_device(Script::Finite(vec![(
            "hw_app_state",
            r#"{"duty": 12.5, "fan_active": true}"#.to_string(),
        )]))
        .await;
        let (watchdog, liveness) = watchdog();
        let (sink, received) = collecting_sink();
        let (channel, _task) =
            StateChannel::spawn(settings(&base, 10_000), Client::new(), watchdog.clone(), sink);

        wait_until(&channel, |s| s.snapshots == 1).await;

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["duty"], FieldValue::Number(12.5));
        assert_eq!(watchdog.status(), WatchdogStatus::Alive);
        assert_eq!(*liveness.lock().unwrap(), vec![WatchdogStatus::Alive]);
        channel.shutdown();
    }

    #[tokio::test]
    async fn malformed_snapshot_is_skipped_but_counts_as_heartbeat() {
        let (base, _device) = spawn_device(Script::Finite(vec![
            ("hw_app_state", "{not json".to_string()),
            ("heartbeat", "HB".to_string()),
            ("hw_app_state", r#"{"duty": 3}"#.to_string()),
        ]))
        .await;
        let (watchdog, liveness) = watchdog();
        let (sink, received) = collecting_sink();
        let (channel, _task) =
            StateChannel::spawn(settings(&base, 10_000), Client::new(), watchdog, sink);

        let status = wait_until(&channel, |s| s.snapshots == 1).await;

        assert_eq!(status.malformed, 1);
        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(*liveness.lock().unwrap(), vec![WatchdogStatus::Alive]);
        channel.shutdown();
    }

    #[tokio::test]
    async fn closed_streams_are_reopened_one_at_a_time_after_the_delay() {
        let (base, device) = spawn_device(Script::Finite(vec![(
            "hw_app_state",
            r#"{"duty": 1}"#.to_string(),
        )]))
        .await;
        let (watchdog, _) = watchdog();
        let (sink, _) = collecting_sink();
        let delay = Duration::from_millis(80);
        let (channel, _task) = StateChannel::spawn(
            settings(&base, delay.as_millis() as u64),
            Client::new(),
            watchdog,
            sink,
        );

        let status = wait_until(&channel, |s| s.connect_attempts >= 4 && s.snapshots >= 4).await;
        channel.shutdown();

        assert!(status.last_error.is_some());
        assert_eq!(device.max_open.load(Ordering::SeqCst), 1);
        let accepted = device.accepted.lock().unwrap().clone();
        assert!(accepted.len() >= 4);
        for pair in accepted.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= delay);
        }
    }

    #[tokio::test]
    async fn refused_subscription_retries_without_giving_up() {
        let (base, device) = spawn_device(Script::Unavailable).await;
        let (watchdog, liveness) = watchdog();
        let (sink, received) = collecting_sink();
        let delay = Duration::from_millis(50);
        let (channel, _task) = StateChannel::spawn(
            settings(&base, delay.as_millis() as u64),
            Client::new(),
            watchdog,
            sink,
        );

        let status = wait_until(&channel, |s| s.connect_attempts >= 5).await;
        channel.shutdown();

        assert!(status
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("503"));
        assert!(received.lock().unwrap().is_empty());
        assert!(liveness.lock().unwrap().is_empty());
        let accepted = device.accepted.lock().unwrap().clone();
        for pair in accepted.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= delay);
        }
    }

    #[tokio::test]
    async fn suspend_stops_reconnects_until_resume() {
        let (base, device) = spawn_device(Script::Unavailable).await;
        let (watchdog, liveness) = watchdog();
        let (sink, _) = collecting_sink();
        let (channel, _task) = StateChannel::spawn(
            settings(&base, 50),
            Client::new(),
            watchdog.clone(),
            sink,
        );

        wait_until(&channel, |s| {
            s.connect_attempts >= 1 && s.state == ConnectionState::Disconnected
        })
        .await;
        channel.suspend();
        let status = wait_until(&channel, |s| s.suspended).await;
        let attempts = status.connect_attempts;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(channel.status().connect_attempts, attempts);
        assert_eq!(device.accepted.lock().unwrap().len() as u64, attempts);
        // Suspending disables the watchdog, which re-enables the controls.
        assert_eq!(*liveness.lock().unwrap(), vec![WatchdogStatus::Alive]);

        channel.resume();
        wait_until(&channel, |s| !s.suspended && s.connect_attempts > attempts).await;
        channel.shutdown();
    }

    #[tokio::test]
    async fn resume_replaces_the_open_subscription() {
        let (base, device) = spawn_device(Script::Endless).await;
        let (watchdog, _) = watchdog();
        let (sink, received) = collecting_sink();
        let (channel, task) =
            StateChannel::spawn(settings(&base, 10_000), Client::new(), watchdog, sink);

        wait_until(&channel, |s| s.snapshots >= 2).await;
        channel.suspend();
        wait_until(&channel, |s| s.suspended).await;
        // Snapshots keep flowing to the sink while suspended.
        let before = received.lock().unwrap().len();
        wait_until(&channel, |s| s.snapshots as usize >= before + 2).await;

        channel.resume();
        let status = wait_until(&channel, |s| {
            s.connect_attempts == 2 && s.state == ConnectionState::Open
        })
        .await;
        assert!(!status.suspended);
        assert_eq!(device.accepted.lock().unwrap().len(), 2);

        channel.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("channel task should stop")
            .unwrap();
        assert_eq!(channel.status().state, ConnectionState::Disconnected);
    }
}
