//! Find a scale, connect, and print weight changes.
//!
//! Run with: cargo run --example scale_monitor

use scale_link_ble::{Result, ScaleClient, SessionState};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scale_link_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Looking for scales...");
    println!("Make sure the scale is switched on!\n");

    let client = ScaleClient::new().await?;

    let _devices = client.on_device_discovered(|scale| {
        println!("  Found {} ({})", scale.name(), scale.identifier());
    });
    let _states = client.on_state_changed(|state| {
        println!("  Session: {}", state);
    });

    if !client.open_picker().await {
        println!("Bluetooth permissions denied, nothing to do.");
        return Ok(());
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(10)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
            client.shutdown().await?;
            return Ok(());
        }
    }
    client.close_picker().await;

    let Some(scale) = client.devices().into_iter().next() else {
        println!("No scale found.");
        return client.shutdown().await;
    };

    if !client.select_peripheral(scale.identifier()).await {
        println!("Could not connect to {}.", scale.name());
        return client.shutdown().await;
    }

    // Listen first so the first notification is not missed.
    let mut readings = client.subscribe_readings();
    client.set_monitoring(true).await;
    println!("\nWeight Is: {} kg", client.weight());

    loop {
        tokio::select! {
            reading = readings.recv() => match reading {
                Ok(reading) => println!("Weight Is: {} kg", reading),
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }

        if client.state() != SessionState::Subscribed {
            println!("Scale went away.");
            break;
        }
    }

    client.set_monitoring(false).await;
    client.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
