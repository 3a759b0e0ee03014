use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Select};
use hublink::{
    auto_reconnect, init_logging, list_ports, session_from_config, AutoReconnectOutcome, Config,
    DeviceCandidate, DeviceChooser, DeviceEvent, DeviceSession, LineDecoder, TransportKind,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(
    name = "hublink",
    version,
    about = "Talk to a LEGO hub's Python REPL over USB or Bluetooth"
)]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Transport for the interactive connection: usb or ble
    #[arg(long, value_name = "KIND")]
    transport: Option<TransportKind>,

    /// Do not resume a previously authorized USB hub
    #[arg(long)]
    no_auto_reconnect: bool,

    /// Store the connected USB port in the configuration file
    #[arg(long)]
    remember: bool,

    /// Print the serial ports a hub could be on and exit
    #[arg(long)]
    list_ports: bool,
}

/// Terminal device picker; Esc dismisses it
struct TerminalChooser;

#[async_trait]
impl DeviceChooser for TerminalChooser {
    async fn choose(
        &self,
        kind: TransportKind,
        candidates: Vec<DeviceCandidate>,
    ) -> Option<DeviceCandidate> {
        let picked = tokio::task::spawn_blocking(move || {
            let items: Vec<String> = candidates
                .iter()
                .map(|c| format!("{} ({})", c.name, c.id))
                .collect();
            let selection = Select::with_theme(&ColorfulTheme::default())
                .with_prompt(format!("Select a {} hub", kind))
                .items(&items)
                .default(0)
                .interact_opt();
            match selection {
                Ok(Some(index)) => candidates.into_iter().nth(index),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("Device chooser failed: {}", e);
                    None
                }
            }
        })
        .await;

        picked.ok().flatten()
    }
}

async fn connect(session: &DeviceSession, cli: &Cli, config: &Config) -> anyhow::Result<bool> {
    let kind = cli.transport.unwrap_or(TransportKind::Usb);

    if config.auto_reconnect && !cli.no_auto_reconnect && kind == TransportKind::Usb {
        match auto_reconnect(session).await {
            AutoReconnectOutcome::Connected(port) => {
                tracing::info!("Resumed {}", port);
                return Ok(true);
            }
            AutoReconnectOutcome::NoAuthorizedPorts => {}
            AutoReconnectOutcome::Failed(reason) => {
                tracing::debug!("Falling back to the chooser: {}", reason);
            }
        }
    }

    let outcome = session.connect(kind).await;
    if outcome.is_cancellation {
        eprintln!("No device selected");
        return Ok(false);
    }
    if !outcome.success {
        anyhow::bail!(outcome
            .error
            .unwrap_or_else(|| "connection failed".to_string()));
    }
    Ok(true)
}

async fn run_repl(session: &DeviceSession) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut events = session.subscribe_events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(DeviceEvent::Disconnected { device_initiated: true }) => {
                    eprintln!("Hub disconnected");
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                match line.trim() {
                    ":quit" => break,
                    ":stop" => {
                        session.interrupt();
                    }
                    "" => {}
                    command => {
                        if let Err(e) = session.write_and_wait(command.as_bytes()).await {
                            eprintln!("{}", e);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    if cli.list_ports {
        for port in list_ports()? {
            println!("{}\t{}", port.port_name, port.description);
        }
        return Ok(());
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_config_path()?,
    };
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let session = session_from_config(&config, Arc::new(TerminalChooser));

    let decoder = Arc::new(Mutex::new(LineDecoder::new()));
    let printer = Arc::clone(&decoder);
    session.on_notify(move |bytes: &[u8]| {
        for line in printer.lock().push(bytes) {
            println!("{}", line);
        }
    });

    if !connect(&session, &cli, &config).await? {
        return Ok(());
    }

    let device = session.device();
    eprintln!("Connected: {}  (:stop interrupts, :quit exits)", device);

    if cli.remember && device.transport_kind == TransportKind::Usb {
        if let Some(port) = device.id.clone() {
            config.remember_port(port);
            config
                .save_to_file(&config_path)
                .with_context(|| format!("saving {}", config_path.display()))?;
        }
    }

    let result = run_repl(&session).await;
    session.disconnect().await;

    if let Some(rest) = decoder.lock().finish() {
        println!("{}", rest);
    }

    result
}
