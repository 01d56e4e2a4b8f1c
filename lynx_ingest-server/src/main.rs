// src/main.rs

mod blocks_ws;
mod control;
mod routes;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use std::{env, error::Error};

use dotenv::dotenv;
use log::{error, info, warn};
use lynx_ingest_lib::config::{DEFAULT_PORT, parse_port};
use lynx_ingest_lib::packet::{MAX_BOARDS, MIN_BOARDS};
use lynx_ingest_lib::simulator::SimulatorHandle;
use lynx_ingest_lib::{Acquisition, AcquisitionConfig, Context, Simulator};
use warp::Filter;

/* RUST_LOG=lynx_ingest_lib=debug,lynx_ingest_server=info \
LYNX_SIMULATE=2x30000 cargo run -p lynx_ingest-server */

const DEFAULT_HTTP_PORT: u16 = 3030;
const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 1_000;

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|_| format!("Environment variable {} has an invalid value {:?}", name, text)),
        Err(_) => Ok(default),
    }
}

/// `<boards>x<rate>`, e.g. `2x30000`.
fn parse_simulate(text: &str) -> Result<(usize, u32), String> {
    let invalid = || format!("LYNX_SIMULATE must look like 2x30000, got {:?}", text);
    let (boards, rate) = text.trim().split_once('x').ok_or_else(invalid)?;
    let boards: usize = boards.parse().map_err(|_| invalid())?;
    let rate: u32 = rate.parse().map_err(|_| invalid())?;
    if !(MIN_BOARDS..=MAX_BOARDS).contains(&boards) {
        return Err(format!(
            "LYNX_SIMULATE board count must be {MIN_BOARDS}..={MAX_BOARDS}, got {boards}"
        ));
    }
    if rate == 0 {
        return Err("LYNX_SIMULATE sample rate must be non-zero".to_string());
    }
    Ok((boards, rate))
}

fn build_config(simulating: bool) -> Result<AcquisitionConfig, Box<dyn Error>> {
    let port = match env::var("LYNX_PORT") {
        Ok(text) => parse_port(&text)?,
        Err(_) => DEFAULT_PORT,
    };
    let fixed = match env::var("LYNX_ADDRESS") {
        Ok(text) => Some(
            text.trim()
                .parse::<IpAddr>()
                .map_err(|_| format!("LYNX_ADDRESS is not an IP address: {:?}", text))?,
        ),
        // a simulated source talks to loopback unless told otherwise
        Err(_) if simulating => Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        Err(_) => None,
    };

    Ok(match fixed {
        Some(ip) => AcquisitionConfig::fixed(ip, port),
        None => AcquisitionConfig {
            port,
            ..AcquisitionConfig::default()
        },
    })
}

fn start_simulator(text: &str, config: &AcquisitionConfig) -> Result<SimulatorHandle, Box<dyn Error>> {
    let (boards, rate) = parse_simulate(text)?;
    let ip = config.selected.ok_or("no address to aim the simulator at")?;
    let handle = Simulator::new(boards, rate, SocketAddr::new(ip, config.port)).spawn()?;
    Ok(handle)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<(), Box<dyn Error>> {
    // ──────── ① Load .env (optional) ────────
    let dotenv_result = dotenv();

    // initialize logger and panic hook
    env_logger::init();
    std::panic::set_hook(Box::new(|info| {
        error!("Thread panic: {:?}", info);
    }));
    if let Err(e) = dotenv_result {
        warn!("No .env loaded: {}", e);
    }

    // ──────── ② Configuration ────────
    let simulate = env::var("LYNX_SIMULATE").ok();
    let config = build_config(simulate.is_some())?;
    let http_port = env_parsed("LYNX_HTTP_PORT", DEFAULT_HTTP_PORT)?;
    let interval = Duration::from_millis(env_parsed(
        "LYNX_DISCOVERY_INTERVAL_MS",
        DEFAULT_DISCOVERY_INTERVAL_MS,
    )?);

    info!(
        "Listening for packets on port {} ({})",
        config.port,
        config
            .selected
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "interfaces enumerated".into())
    );

    // ──────── ③ Optional synthetic source ────────
    let _simulator = match simulate.as_deref() {
        Some(text) => Some(start_simulator(text, &config)?),
        None => None,
    };

    // shared broadcast context: events and decoded blocks
    let ctx = Context::new(1024);

    // ──────── ④ Control thread owns the acquisition ────────
    let acq = Acquisition::with_context(config, ctx.clone());
    let control = control::spawn(acq, interval)?;

    // ──────── ⑤ HTTP + SSE + WebSocket ────────
    let routes = routes::control_routes(control, ctx.tx.clone()).or(blocks_ws::ws_routes(ctx.tx.clone()));

    info!("HTTP  : 0.0.0.0:{} (status + control)", http_port);
    info!("SSE   : 0.0.0.0:{}/events", http_port);
    info!("WS    : 0.0.0.0:{}/blocks", http_port);

    warp::serve(routes).run(([0, 0, 0, 0], http_port)).await;
    Ok(())
}
