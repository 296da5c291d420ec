use std::time::Duration;

use anyhow::{bail, Context};
use printlink::{Event, PrinterService};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "scan".into());

    match command.as_str() {
        "scan" => {
            let seconds = args.next().and_then(|s| s.parse().ok()).unwrap_or(15);
            scan(seconds).await
        }
        "state" => state().await,
        "print" => {
            let address = args
                .next()
                .context("usage: printlink print <address> <text>")?;
            let text: Vec<String> = args.collect();
            if text.is_empty() {
                bail!("usage: printlink print <address> <text>");
            }
            print(&address, text.join(" ").as_bytes()).await
        }
        other => bail!("unknown command: {other} (expected scan, state or print)"),
    }
}

async fn scan(seconds: u64) -> anyhow::Result<()> {
    let service = PrinterService::new().await?;
    info!("scanning for {seconds}s, bonded devices listed first");

    let mut subscription = service.subscribe().await;
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = subscription.recv() => match event {
                Some(Event::DeviceDiscovered(device)) => {
                    info!(
                        "  {}  {}  class {:#06x}",
                        device.address,
                        device.name.as_deref().unwrap_or("<unnamed>"),
                        device.device_class
                    );
                }
                Some(Event::AdapterChanged(state)) => info!("adapter: {state:?}"),
                Some(_) => {}
                None => break,
            }
        }
    }

    service.unsubscribe(subscription.id).await;
    service.shutdown().await;
    Ok(())
}

async fn state() -> anyhow::Result<()> {
    let service = PrinterService::new().await?;
    let state = service.get_state().await;
    info!("adapter state: {state:?} (code {})", state.code());
    service.shutdown().await;
    Ok(())
}

async fn print(address: &str, payload: &[u8]) -> anyhow::Result<()> {
    let service = PrinterService::new().await?;
    info!(address, bytes = payload.len(), "writing to printer");

    service.write(address, payload, false).await?;

    info!("done");
    service.shutdown().await;
    Ok(())
}
