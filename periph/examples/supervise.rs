//! Supervise the devices listed in a TOML config and print their events.
//!
//! Usage: supervise <config.toml> [seconds]

use std::time::Duration;

use anyhow::Context;
use periph::{config::HostConfig, supervisor::DeviceEvent, DeviceHost};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "periph=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().context("usage: supervise <config.toml> [seconds]")?;
    let seconds: u64 = args.next().as_deref().unwrap_or("30").parse()?;

    let config = HostConfig::from_file(&path)?;
    let host = DeviceHost::start(config).await?;
    println!("supervising: {:?}", host.devices());

    let mut events = host.subscribe();
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => {
                let Ok(event) = event else { break };
                match event.event {
                    DeviceEvent::Connected => println!("[{}] connected", event.device),
                    DeviceEvent::Disconnected => println!("[{}] disconnected", event.device),
                    DeviceEvent::StatusUpdated(snapshot) => {
                        println!("[{}] {}", event.device, snapshot);
                        for alarm in &snapshot.alarms {
                            println!("[{}]   {}", event.device, alarm);
                        }
                    }
                    DeviceEvent::Faulted { code, message } => {
                        println!("[{}] fault {}: {}", event.device, code, message)
                    }
                    DeviceEvent::Data(decode) => {
                        println!("[{}] barcode ({:#04x}): {}", event.device, decode.symbology, decode.text)
                    }
                }
            }
        }
    }

    host.shutdown().await;
    Ok(())
}
