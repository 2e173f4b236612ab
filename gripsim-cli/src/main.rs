use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use humantime::format_duration;
use tokio::time;
use tracing::{info, warn};

use gripsim_domain::{mode::SimulationMode, tree::GRIP_DATA_CHARACTERISTIC_UUID};
use gripsim_peripheral::{
    config::PeripheralConfig,
    peripheral::{Peripheral, PeripheralStatus},
    sim::{SimCentral, SimTransport},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file with a peripheral configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// advertised device name
    #[arg(short, long)]
    name: Option<String>,

    /// notification interval, e.g. 500ms or 1s
    #[arg(short, long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// maximum number of concurrently connected clients
    #[arg(long)]
    max_clients: Option<usize>,

    /// simulation mode: normal, exercise or rest
    #[arg(short, long)]
    mode: Option<SimulationMode>,

    /// seed for reproducible readings
    #[arg(long)]
    seed: Option<u64>,

    /// keep advertising while clients are connected
    #[arg(long)]
    advertise_while_connected: bool,

    /// number of simulated centrals that connect and subscribe to grip data
    #[arg(long, default_value_t = 1)]
    clients: usize,

    /// artificial latency for every notification sent to the simulated centrals
    #[arg(long, value_parser = humantime::parse_duration)]
    delivery_delay: Option<Duration>,

    /// how often to print a status report
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    report_every: Duration,

    /// stop after this long instead of waiting for ctrl-c
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// print status reports as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = config(&args)?;

    let transport = Arc::new(SimTransport::new());
    transport.set_delivery_delay(args.delivery_delay);
    let peripheral = Peripheral::new(transport).context("building GATT tree failed")?;
    peripheral
        .start(config)
        .await
        .context("starting peripheral failed")?;

    let centrals = connect_centrals(&peripheral, args.clients).await;
    run(&peripheral, &args).await?;

    peripheral.stop();
    for central in centrals {
        info!("{} disconnecting", central.address());
        central.disconnect().await;
    }
    print_status(&peripheral.status(), Utc::now(), args.json)?;
    Ok(())
}

fn config(args: &Args) -> Result<PeripheralConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {} failed", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing {} failed", path.display()))?
        }
        None => PeripheralConfig::default(),
    };
    if let Some(name) = &args.name {
        config.device_name = name.clone();
    }
    if let Some(interval) = args.interval {
        config.notify_interval = interval;
    }
    if let Some(max_clients) = args.max_clients {
        config.max_clients = max_clients;
    }
    if args.mode.is_some() {
        config.initial_mode = args.mode;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.advertise_while_connected |= args.advertise_while_connected;
    Ok(config)
}

async fn connect_centrals(peripheral: &Peripheral, count: usize) -> Vec<SimCentral> {
    let mut centrals = Vec::with_capacity(count);
    for index in 0..count {
        let address = format!("AA:BB:CC:DD:EE:{:02X}", index % 256);
        match SimCentral::connect(peripheral, &address).await {
            Ok(central) => {
                if let Err(error) = central.subscribe(GRIP_DATA_CHARACTERISTIC_UUID) {
                    warn!("{address} could not subscribe: {error}");
                }
                centrals.push(central);
            }
            Err(error) => warn!("{address} could not connect: {error}"),
        }
    }
    centrals
}

async fn run(peripheral: &Peripheral, args: &Args) -> Result<()> {
    let deadline = async {
        match args.duration {
            Some(duration) => time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut reports = time::interval(args.report_every);
    loop {
        tokio::select! {
            _ = reports.tick() => print_status(&peripheral.status(), Utc::now(), args.json)?,
            _ = &mut deadline => {
                info!("Run time elapsed, stopping");
                return Ok(());
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for ctrl-c failed")?;
                info!("Interrupted, stopping");
                return Ok(());
            }
        }
    }
}

fn print_status(status: &PeripheralStatus, now: DateTime<Utc>, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(status).context("serializing status failed")?
        );
        return Ok(());
    }

    let runtime = status
        .started_at
        .and_then(|started| (now - started).to_std().ok())
        .map(|elapsed| format_duration(Duration::from_secs(elapsed.as_secs())).to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "\n=== {} at {} (Runtime: {}) ===",
        status.device_name.as_deref().unwrap_or("peripheral"),
        now,
        runtime
    );
    println!(
        "State: {:?}, mode: {}, generation {}",
        status.advertising_state,
        status.mode,
        if status.generation_paused {
            "paused"
        } else {
            "running"
        }
    );
    println!("Reading: {}", status.current_reading);

    if !status.clients.is_empty() {
        println!("\n{:<12} {:<20} {:>10}", "Client", "Address", "Connected");
        println!("{}", "-".repeat(44));
        for client in &status.clients {
            let connected = (now - client.connected_at)
                .to_std()
                .map(|age| format_duration(Duration::from_secs(age.as_secs())).to_string())
                .unwrap_or_default();
            println!(
                "{:<12} {:<20} {:>10}",
                client.id.to_string(),
                client.address,
                connected
            );
        }
    }
    println!(
        "\nClients: {}, notifications sent: {}",
        status.connected_clients, status.notifications_sent
    );
    Ok(())
}
