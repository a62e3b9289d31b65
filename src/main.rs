#![forbid(unsafe_code)]

use anyhow::Result;
use chatload::config::HarnessConfig;
use chatload::scenario::{default_scenarios, sweep, ScenarioConfig};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = HarnessConfig::from_env();
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut scenarios: Vec<ScenarioConfig> = Vec::new();
    let mut json = false;

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                if i + 1 < args.len() {
                    host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--port" => {
                if i + 1 < args.len() {
                    port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--scenario" => {
                if i + 1 < args.len() {
                    match ScenarioConfig::parse(&args[i + 1]) {
                        Some(sc) => scenarios.push(sc),
                        None => eprintln!("Invalid scenario '{}', expected USERS:MESSAGES", args[i + 1]),
                    }
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--wait-ms" => {
                if i + 1 < args.len() {
                    if let Ok(ms) = args[i + 1].parse() {
                        config.wait_window = Duration::from_millis(ms);
                    }
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--stabilize-secs" => {
                if i + 1 < args.len() {
                    if let Ok(secs) = args[i + 1].parse() {
                        config.stabilize_pause = Duration::from_secs(secs);
                    }
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--json" => {
                json = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                eprintln!("Ignoring unknown argument '{}'", other);
                i += 1;
            }
        }
    }

    // Re-target after all args are parsed so --host/--port order doesn't matter
    if host.is_some() || port.is_some() {
        let current = config.base_url.trim_start_matches("http://").trim_start_matches("https://");
        let (cur_host, cur_port) = current.rsplit_once(':').unwrap_or((current, "6262"));
        let host = host.unwrap_or_else(|| cur_host.to_string());
        let port = port.map(|p| p.to_string()).unwrap_or_else(|| cur_port.to_string());
        let retargeted = HarnessConfig::for_server(&format!("http://{host}:{port}"));
        config.base_url = retargeted.base_url;
        config.ws_url = retargeted.ws_url;
    }
    config.validate()?;

    if scenarios.is_empty() {
        scenarios = default_scenarios();
    }

    let http = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()?;

    info!("Running {} scenario(s) against {}", scenarios.len(), config.base_url);
    let report = sweep(&config, http, &scenarios).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print_summary();
    }
    Ok(())
}

fn print_usage() {
    println!("chatload - concurrent load tester for real-time chat services");
    println!("\nUsage:");
    println!("  chatload [OPTIONS]");
    println!("\nOptions:");
    println!("  --host <HOST>              Service host (default: $SERVER_HOST or localhost)");
    println!("  --port <PORT>              Service port (default: $SERVER_PORT or 6262)");
    println!("  --scenario <USERS:MSGS>    Add a scenario; repeatable (default: 10:20 25:40 50:60)");
    println!("  --wait-ms <MS>             Delivery wait window per message (default: 5000)");
    println!("  --stabilize-secs <SECS>    Pause between scenarios (default: 5)");
    println!("  --json                     Print the report as JSON");
    println!("  -h, --help                 Print this help message");
    println!("\nEnvironment Variables:");
    println!("  SERVER_HOST, SERVER_PORT          Target service");
    println!("  CHATLOAD_WAIT_WINDOW_MS           Delivery wait window");
    println!("  CHATLOAD_POLL_INTERVAL_MS         Fallback wake-up interval while waiting");
    println!("  CHATLOAD_STABILIZE_SECS           Pause between scenarios");
    println!("  CHATLOAD_PROVISION_CONCURRENCY    Max in-flight credential requests");
    println!("  CHATLOAD_CONNECT_TIMEOUT_SECS     Connection establishment timeout");
    println!("  RUST_LOG=debug                    Enable debug logging");
}
