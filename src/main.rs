use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use home_panel::device::DeviceKind;
use home_panel::service::{Controllers, DeviceController};
use home_panel::{Api, Settings};

#[derive(Parser)]
#[command(name = "home-panel")]
#[command(about = "Control and monitor a Vizio TV and a Denon receiver")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect both devices and log every status change until Ctrl-C
    Serve,
    /// Print the current status and connection state of a device
    Status { device: DeviceKind },
    /// Send one command, e.g. `command avr SET_VOLUME 45.5`
    Command {
        device: DeviceKind,
        name: String,
        value: Option<String>,
    },
    /// Scan the LAN for a device and persist the best match
    Discover { device: DeviceKind },
    /// Pair with the TV: shows a PIN on screen and reads it from stdin
    Pair,
    /// Forget the TV credential and reconnect
    Reset,
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => tracing::error!("Failed to render output: {}", e),
    }
}

async fn serve(api: &Api) {
    let (tx, mut shutdown) = mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        tracing::error!("Failed to install Ctrl-C handler: {}", e);
    }

    let mut tv_rx = api.subscribe_status(DeviceKind::Tv);
    let mut avr_rx = api.subscribe_status(DeviceKind::Avr);
    let mut err_rx = api.subscribe_errors();

    let (tv, avr) = api.controllers().init_all().await;
    tracing::info!("TV: {}, receiver: {}", tv.state.label(), avr.state.label());

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Ok(msg) = tv_rx.recv() => tracing::info!("TV status: {}", msg),
            Ok(msg) = avr_rx.recv() => tracing::info!("Receiver status: {}", msg),
            Ok(msg) = err_rx.recv() => tracing::warn!("Device error: {}", msg),
            else => break,
        }
    }

    tracing::info!("Shutting down");
    api.controllers().cleanup_all().await;
}

/// The pairing session lives in the client, so both steps share one process
async fn pair(api: &Api) -> bool {
    if let Err(e) = api.initiate_pairing().await {
        print_json(&e);
        return false;
    }
    eprint!("PIN shown on the TV: ");

    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    if let Err(e) = stdin.read_line(&mut line).await {
        tracing::error!("Failed to read PIN: {}", e);
        return false;
    }

    match api.complete_pairing(&line).await {
        Ok(outcome) => {
            print_json(&outcome);
            outcome.success
        }
        Err(e) => {
            print_json(&e);
            false
        }
    }
}

async fn run(cli: Cli) -> home_panel::Result<bool> {
    let controllers = Controllers::from_settings(&cli.settings)?;
    let api = Api::new(controllers.clone());

    let ok = match cli.command {
        Command::Serve => {
            serve(&api).await;
            true
        }
        Command::Status { device } => {
            let controller = controllers.get(device);
            controller.init().await;
            print_json(&controller.connection_status().await);
            print_json(&controller.current_status().await);
            true
        }
        Command::Command {
            device,
            name,
            value,
        } => {
            controllers.get(device).init().await;
            let result = api.send_command(device, &name, value.as_deref()).await;
            match result {
                Ok(response) => {
                    print_json(&response);
                    response.success
                }
                Err(e) => {
                    print_json(&e);
                    false
                }
            }
        }
        Command::Discover { device } => match controllers.discovery(device) {
            Some(discovery) => match discovery.discover().await {
                Some(best) => {
                    print_json(&best.candidate);
                    true
                }
                None => {
                    tracing::warn!("No {} found on the network", device);
                    false
                }
            },
            None => {
                tracing::warn!("Discovery is disabled");
                false
            }
        },
        Command::Pair => {
            controllers.tv.init().await;
            pair(&api).await
        }
        Command::Reset => {
            print_json(&api.reset_connection().await);
            true
        }
    };

    controllers.cleanup_all().await;
    Ok(ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.settings.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
