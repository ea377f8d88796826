use pspwm_remote::arbitrator::EditArbitrator;
use pspwm_remote::channel::{ChannelSettings, StateChannel, StateSink};
use pspwm_remote::config::Config;
use pspwm_remote::dispatch::{
    Command, CommandDispatcher, CommandError, CommandTransport, FailureHook, HttpCommandClient,
};
use pspwm_remote::session::{parse_console_line, Session, SessionEvent, CONSOLE_HELP};
use pspwm_remote::view::standard_layout;
use pspwm_remote::watchdog::{LivenessHook, LivenessWatchdog};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    match std::env::args().nth(1).as_deref() {
        None | Some("run") => run_session(config).await,
        Some("send") => handle_send(&config).await,
        Some("config-init") => handle_config_init(),
        Some(other) => {
            Err(format!("unknown command: {other} (expected run, send or config-init)").into())
        }
    }
}

async fn run_session(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let liveness_tx = events_tx.clone();
    let on_liveness: LivenessHook = Arc::new(move |status| {
        let _ = liveness_tx.send(SessionEvent::Liveness(status));
    });
    let watchdog = LivenessWatchdog::new(config.timing.watchdog_timeout(), on_liveness);

    let snapshot_tx = events_tx.clone();
    let sink: StateSink = Box::new(move |state| {
        let _ = snapshot_tx.send(SessionEvent::Snapshot(state));
    });

    // The subscription is long-lived, so only the connect phase gets a timeout.
    let events_http = reqwest::Client::builder()
        .connect_timeout(config.device.request_timeout())
        .build()?;
    let settings = ChannelSettings::from_config(&config.device, &config.timing)?;
    tracing::info!(url = %settings.events_url, "starting state channel");
    let (channel, channel_task) =
        StateChannel::spawn(settings, events_http, watchdog.clone(), sink);

    let transport = HttpCommandClient::new(
        &config.device.base_url,
        &config.device.command_path,
        config.device.request_timeout(),
    )?;
    let on_failure: FailureHook = Arc::new(|command: &Command, err: &CommandError| {
        tracing::error!(command = %command, error = %err, "command failed");
        eprintln!("command {command} failed: {err}");
    });
    let (dispatcher, dispatch_task) =
        CommandDispatcher::spawn(transport, config.timing.request_interval(), on_failure);

    let mut arbitrator = EditArbitrator::new(config.timing.slider_release_grace());
    for (field, binding) in standard_layout() {
        arbitrator.track(field, binding);
    }
    let mut session = Session::new(arbitrator, dispatcher, Some(channel.clone()), events_rx);

    println!("{CONSOLE_HELP}");
    let console = tokio::spawn(read_console(events_tx));

    tokio::select! {
        _ = session.run() => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("shutdown: ctrl-c");
        }
    }

    console.abort();
    channel.shutdown();
    watchdog.disable();
    let _ = channel_task.await;
    // Dropping the session drops the last dispatcher handle.
    drop(session);
    let _ = dispatch_task.await;
    Ok(())
}

async fn read_console(events: mpsc::UnboundedSender<SessionEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_console_line(&line) {
                Ok(Some(event)) => {
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => eprintln!("{err}\n{CONSOLE_HELP}"),
            },
            Ok(None) => {
                tracing::debug!("console input closed");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "console read failed");
                break;
            }
        }
    }
}

async fn handle_send(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let name = args
        .next()
        .ok_or("missing command name (usage: send <name> [value])")?;
    let command = Command::new(name, args.next());

    let client = HttpCommandClient::new(
        &config.device.base_url,
        &config.device.command_path,
        config.device.request_timeout(),
    )?;
    client.transmit(&command).await?;

    tracing::info!(command = %command, "command sent");
    println!("sent {command}");
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
