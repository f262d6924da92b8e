mod util;
use crate::util::LogError;

use anyhow::{bail, Context};
use cellwatch::{
    ble::BleTransport,
    frame,
    hub::{self, Hub},
    permission::{PermissionStatus, Unrestricted},
    sim::{Simulator, SimulatorConfig},
    sink::{Envelope, Sink},
    transport::{Transport, TransportEvent},
    Config, ErrorKind, PeripheralHandle, Status,
};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use futures::StreamExt;
use indoc::indoc;
use log::{error, info, warn};
use tokio::{
    sync::{broadcast, mpsc},
    time::{sleep, Duration},
};

enum Command {
    Scan,
    Stream {
        device: Option<String>,
        user: String,
        battery_id: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cmd = App::new("cellwatch")
        .version("0.1")
        .about("Stream cell telemetry from BLE battery monitors")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .help("Sets custom config file location")
                .long_help(indoc!(
                    "Sets custom config file location, default to read cellwatch.yaml
                    The custom config must be a file of YAML 1.2 format.
                    Defaults are used when the file does not exist.
                    The following configuration keys are supported:
                    name_marker: optional, default ESP32, substring an advertised name must contain
                    scan_timeout: optional, default 10s, upper bound of a scan
                    connect_timeout: optional, default 10s, bound on connecting and on discovery
                    characteristic: optional, preferred telemetry characteristic UUID
                    event_capacity: optional, default 64, per-subscriber buffer
                    imbalance_threshold_mv: optional, default 200, cell spread flagged as imbalance
                    user: optional, user or session identifier attached to readings
                    battery_id: optional, default primary-battery-001
                    sinks: optional, default [Console], list of Console or File: {path}
                    "
                ))
                .value_name("FILE")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Uses a simulated monitor instead of the Bluetooth adapter")
                .global(true),
        )
        .subcommand(SubCommand::with_name("scan").about("Lists nearby battery monitors"))
        .subcommand(
            SubCommand::with_name("stream")
                .about("Connects to a monitor and forwards its readings to the sinks")
                .arg(
                    Arg::with_name("device")
                        .short("d")
                        .long("device")
                        .help("Identifier of the monitor, default to the first one found")
                        .value_name("ID")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("user")
                        .short("u")
                        .long("user")
                        .help("User or session identifier attached to readings")
                        .value_name("USER")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("battery")
                        .short("b")
                        .long("battery")
                        .help("Battery identifier attached to readings")
                        .value_name("ID")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("decode")
                .about("Decodes one captured frame")
                .arg(
                    Arg::with_name("frame")
                        .help("Frame bytes in hex, optionally separated by spaces, - or :")
                        .required(true)
                        .multiple(true),
                ),
        )
        .get_matches();
    env_logger::init();

    let (name, sub) = cmd.subcommand();
    let sub = sub.context("no subcommand given")?;
    if name == "decode" {
        return decode(sub);
    }

    let config_path = sub
        .value_of("config")
        .or_else(|| cmd.value_of("config"))
        .unwrap_or("cellwatch.yaml");
    info!("open and parse config file {}", config_path);
    let config = Config::load(config_path)?;

    let command = match name {
        "scan" => Command::Scan,
        _ => Command::Stream {
            device: sub.value_of("device").map(str::to_string),
            user: sub
                .value_of("user")
                .map(str::to_string)
                .or_else(|| config.user.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            battery_id: sub
                .value_of("battery")
                .map(str::to_string)
                .unwrap_or_else(|| config.battery_id.clone()),
        },
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let (termination_sender, termination_receiver) = broadcast::channel(1);
    ctrlc::set_handler(move || {
        info!("signal received, terminating...");
        let _ = termination_sender.send(());
    })
    .context("failed to set up signal handlers")?;

    let simulate = sub.is_present("simulate") || cmd.is_present("simulate");
    let result = runtime.block_on(async move {
        if simulate {
            let (transport, events) =
                Simulator::new(SimulatorConfig::default(), config.event_capacity);
            run(&config, transport, events, command, termination_receiver).await
        } else {
            let (transport, events) = BleTransport::new(config.event_capacity)
                .await
                .context("failed to acquire Bluetooth adapter")?;
            run(&config, transport, events, command, termination_receiver).await
        }
    });
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

fn decode(sub: &ArgMatches) -> anyhow::Result<()> {
    let text = sub
        .values_of("frame")
        .map(|v| v.collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    let bytes = frame::parse_hex(&text).context("frame is not valid hex")?;
    let reading = frame::decode(&bytes)?;
    println!("{}", serde_json::to_string_pretty(&reading)?);
    println!(
        "pack {:.3}V, load {:.3}V, current {:.3}A ({:?}), soc {}%, cells {}-{}mV",
        reading.pack_total_volts(),
        reading.pack_load_volts(),
        reading.current_amps(),
        reading.charging_status(),
        reading.state_of_charge_percent,
        reading.min_cell_millivolts(),
        reading.max_cell_millivolts(),
    );
    Ok(())
}

async fn run<T: Transport>(
    config: &Config,
    transport: T,
    events: mpsc::Receiver<TransportEvent>,
    command: Command,
    termination: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let (hub, backend) = hub::init(config, transport, events, Unrestricted);
    let backend = tokio::spawn(backend.serve());

    if hub.permission() != PermissionStatus::Granted && !hub.request_permission().await {
        bail!("bluetooth permission denied");
    }

    let result = match command {
        Command::Scan => scan(&hub, termination).await,
        Command::Stream {
            device,
            user,
            battery_id,
        } => stream(&hub, config, device, &user, &battery_id, termination).await,
    };

    hub.shutdown();
    if tokio::time::timeout(Duration::from_secs(5), backend)
        .await
        .is_err()
    {
        warn!("backend didn't terminate in time");
    }
    result
}

/// Scan until the window closes, or until `wanted` shows up.
///
/// Resolves to `None` when termination is requested mid-scan.
async fn scan_for(
    hub: &Hub,
    wanted: Option<&str>,
    termination: &mut broadcast::Receiver<()>,
) -> anyhow::Result<Option<Vec<PeripheralHandle>>> {
    let mut discoveries = Box::pin(hub.discoveries());
    let mut state = hub.watch_state();
    hub.start_scan().await?;

    loop {
        tokio::select! {
            _ = termination.recv() => {
                hub.stop_scan().await?;
                return Ok(None);
            }
            Some(peripheral) = discoveries.next() => {
                println!(
                    "found {} rssi {}",
                    peripheral,
                    peripheral.rssi().map_or("?".to_string(), |r| format!("{}dBm", r))
                );
                if wanted.map_or(false, |id| id == peripheral.id()) {
                    hub.stop_scan().await?;
                    break;
                }
            }
            changed = state.changed() => {
                changed.context("bluetooth backend is dead")?;
                if state.borrow_and_update().status != Status::Scanning {
                    break;
                }
            }
        }
    }
    Ok(Some(hub.candidates()))
}

async fn scan(hub: &Hub, mut termination: broadcast::Receiver<()>) -> anyhow::Result<()> {
    match scan_for(hub, None, &mut termination).await? {
        Some(candidates) if candidates.is_empty() => warn!("no battery monitor found"),
        Some(_) => {}
        None => info!("scan interrupted"),
    }
    Ok(())
}

async fn stream(
    hub: &Hub,
    config: &Config,
    device: Option<String>,
    user: &str,
    battery_id: &str,
    mut termination: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let candidates = match scan_for(hub, device.as_deref(), &mut termination).await? {
        Some(candidates) => candidates,
        None => return Ok(()),
    };
    let target = match device {
        Some(id) => candidates.into_iter().find(|p| p.id() == id),
        None => candidates.into_iter().next(),
    };
    let target = match target {
        Some(target) => target,
        None => bail!("no battery monitor found"),
    };

    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    for sink in config.sinks.iter().cloned() {
        sinks.push(sink.into_sink().await?);
    }

    let mut readings = Box::pin(hub.readings());
    let mut errors = Box::pin(hub.errors());
    hub.connect(target.clone()).await?;
    info!("streaming from {}", target);

    let outcome = loop {
        tokio::select! {
            _ = termination.recv() => break Ok(()),
            Some(reading) = readings.next() => {
                let envelope =
                    Envelope::new(user, battery_id, &reading, config.imbalance_threshold_mv)?;
                for sink in sinks.iter_mut() {
                    // Fire-and-forget: a failing sink never stops the stream
                    let _ = sink.update(&envelope).await.pipe_log(|| "failed to forward reading");
                }
            }
            Some(kind) = errors.next() => match kind {
                ErrorKind::MalformedFrame(..) => {}
                kind => {
                    error!("{}", kind);
                    let context = format!("streaming from {} stopped", target);
                    break Err(anyhow::Error::new(kind).context(context));
                }
            },
        }
    };

    let _ = hub.disconnect().await.pipe_log(|| format!("failed to disconnect from {}", target));
    // Give the link a moment to close before the adapter goes away
    sleep(Duration::from_millis(100)).await;
    outcome
}
