//! Rate-limited command dispatch.
//!
//! Commands leave as fire-and-forget `GET {base}/cmd?name=value` requests.
//! Bursts are coalesced instead of queued: while a rate-limit window is open
//! only the most recent command is kept, every earlier one is dropped.

use async_trait::async_trait;
use reqwest::{Client, Method, Request, StatusCode, Url};
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub value: Option<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// Coalescing rate limiter: `Idle -> WindowOpen -> Idle`.
///
/// The limiter does not own a clock. The caller arms a timer for the
/// interval whenever a call returns a command to transmit, and reports the
/// expiry through [`RateLimiter::window_elapsed`].
#[derive(Debug, Default)]
pub struct RateLimiter {
    state: LimiterState,
}

#[derive(Debug, Default, PartialEq, Eq)]
enum LimiterState {
    #[default]
    Idle,
    WindowOpen {
        pending: Option<Command>,
    },
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the command if it may be transmitted right away; otherwise it
    /// replaces whatever was pending in the open window.
    pub fn offer(&mut self, command: Command) -> Option<Command> {
        match &mut self.state {
            LimiterState::WindowOpen { pending } => {
                if let Some(dropped) = pending.replace(command) {
                    tracing::debug!(command = %dropped, "superseded pending command");
                }
                None
            }
            LimiterState::Idle => {
                self.state = LimiterState::WindowOpen { pending: None };
                Some(command)
            }
        }
    }

    /// Closes the current window. A pending command re-opens it and must be
    /// transmitted by the caller.
    pub fn window_elapsed(&mut self) -> Option<Command> {
        match std::mem::take(&mut self.state) {
            LimiterState::WindowOpen {
                pending: Some(command),
            } => {
                self.state = LimiterState::WindowOpen { pending: None };
                Some(command)
            }
            _ => None,
        }
    }

    pub fn is_window_open(&self) -> bool {
        matches!(self.state, LimiterState::WindowOpen { .. })
    }

    pub fn pending(&self) -> Option<&Command> {
        match &self.state {
            LimiterState::WindowOpen { pending } => pending.as_ref(),
            LimiterState::Idle => None,
        }
    }
}

#[derive(Debug)]
pub enum CommandError {
    Url(String),
    Http(reqwest::Error),
    Status { status: StatusCode, body: String },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "network error: {err}"),
            Self::Status { status, body } => {
                write!(f, "device rejected command ({}): {}", status.as_u16(), body)
            }
        }
    }
}

impl std::error::Error for CommandError {}

#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    async fn transmit(&self, command: &Command) -> Result<(), CommandError>;
}

/// Called once for every failed transmission. Never retried.
pub type FailureHook = Arc<dyn Fn(&Command, &CommandError) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct HttpCommandClient {
    http: Client,
    endpoint: Url,
}

impl HttpCommandClient {
    pub fn new(
        base_url: &str,
        command_path: &str,
        timeout: Duration,
    ) -> Result<Self, CommandError> {
        let endpoint = join_endpoint(base_url, command_path).map_err(CommandError::Url)?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CommandError::Http)?;
        Ok(Self { http, endpoint })
    }

    pub fn build_command_request(&self, command: &Command) -> Result<Request, CommandError> {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            match &command.value {
                Some(value) => query.append_pair(&command.name, value),
                None => query.append_key_only(&command.name),
            };
        }
        self.http
            .request(Method::GET, url)
            .build()
            .map_err(CommandError::Http)
    }
}

#[async_trait]
impl CommandTransport for HttpCommandClient {
    async fn transmit(&self, command: &Command) -> Result<(), CommandError> {
        let req = self.build_command_request(command)?;
        let resp = self.http.execute(req).await.map_err(CommandError::Http)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CommandError::Status { status, body })
    }
}

/// Appends `path` to the base URL's path, dropping any query.
pub(crate) fn join_endpoint(base_url: &str, path: &str) -> Result<Url, String> {
    let mut url = Url::parse(base_url.trim()).map_err(|err| err.to_string())?;
    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}/{}", base_path, path.trim_start_matches('/')));
    url.set_query(None);
    Ok(url)
}

/// Cloneable handle feeding the dispatcher task.
#[derive(Clone, Debug)]
pub struct CommandDispatcher {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandDispatcher {
    /// Spawns the dispatch task. It stops once every handle is dropped.
    pub fn spawn<T: CommandTransport>(
        transport: T,
        interval: Duration,
        on_failure: FailureHook,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_dispatcher(
            rx,
            Arc::new(transport),
            interval,
            on_failure,
        ));
        (Self { tx }, task)
    }

    /// Accepts a command without any delivery guarantee.
    pub fn send(&self, name: impl Into<String>, value: Option<String>) {
        self.submit(Command::new(name, value));
    }

    pub fn submit(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::warn!("command dispatcher stopped; dropping command");
        }
    }
}

async fn run_dispatcher<T: CommandTransport>(
    mut rx: mpsc::UnboundedReceiver<Command>,
    transport: Arc<T>,
    interval: Duration,
    on_failure: FailureHook,
) {
    let mut limiter = RateLimiter::new();
    let mut window_closes_at: Option<Instant> = None;

    loop {
        let window = async move {
            match window_closes_at {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            maybe_cmd = rx.recv() => {
                let Some(command) = maybe_cmd else {
                    break;
                };
                if let Some(command) = limiter.offer(command) {
                    window_closes_at = Some(Instant::now() + interval);
                    spawn_transmit(&transport, command, &on_failure);
                }
            }
            _ = window => {
                window_closes_at = None;
                if let Some(command) = limiter.window_elapsed() {
                    window_closes_at = Some(Instant::now() + interval);
                    spawn_transmit(&transport, command, &on_failure);
                }
            }
        }
    }

    if let Some(dropped) = limiter.pending() {
        tracing::debug!(command = %dropped, "dispatcher stopped with a pending command");
    }
}

// Completion is not awaited here: a slow response may overlap with the next
// window's transmission.
fn spawn_transmit<T: CommandTransport>(
    transport: &Arc<T>,
    command: Command,
    on_failure: &FailureHook,
) {
    let transport = Arc::clone(transport);
    let on_failure = Arc::clone(on_failure);
    tokio::spawn(async move {
        tracing::debug!(command = %command, "transmitting command");
        if let Err(err) = transport.transmit(&command).await {
            tracing::warn!(command = %command, error = %err, "command transmission failed");
            on_failure(&command, &err);
        }
    });
}
