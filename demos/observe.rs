//! Observation session example
//!
//! Demonstrates a complete session with one Helena beacon:
//! - Connecting by address
//! - Automatic service discovery and notification setup
//! - Printing every decoded observation
//! - Periodic reads of the observation set
//!
//! Run with: cargo run --example observe -- AA:BB:CC:DD:EE:FF
//!
//! To read the observation set every 10 seconds:
//!   cargo run --example observe -- AA:BB:CC:DD:EE:FF --read-every 10

use helena_ble::{BtleplugTransport, ConnectionState, Error, Result, Session, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,helena_ble=debug,btleplug=warn")
        .init();

    println!("Helena Observation Session");
    println!("==========================\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let Some(address) = args.get(1).filter(|a| !a.starts_with("--")) else {
        eprintln!("Usage: observe <ADDRESS> [--read-every <SECONDS>]");
        return Err(Error::InvalidAddress {
            address: String::new(),
        });
    };
    let read_every = args
        .iter()
        .position(|arg| arg == "--read-every")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);

    let session = Session::new(address, Arc::new(BtleplugTransport::new()))?;
    session.initialize().await?;

    let mut events = session.subscribe();

    println!("Connecting to {}...\n", session.address());
    session.connect()?;

    let mut ticker = read_every.map(tokio::time::interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
            _ = async {
                match ticker.as_mut() {
                    Some(t) => t.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                if session.state() == ConnectionState::Ready {
                    if let Err(e) = session.request_read() {
                        println!("Read failed: {}", e);
                    }
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Connected) => println!("Connected"),
                Ok(SessionEvent::ServicesDiscovered) => {
                    println!("Ready");
                    if let Some(service) = session.matched_service() {
                        println!("  Service: {}", service);
                    }
                    if let Err(e) = session.request_read() {
                        println!("Read failed: {}", e);
                    }
                }
                Ok(SessionEvent::DataNotified(record)) => {
                    println!("Notified ({} bytes): {}", record.len(), record.hex());
                    if let Some(id) = record.device_id_string() {
                        println!("  Device: {}", id);
                    }
                }
                Ok(SessionEvent::DataRead(record)) => {
                    println!("Read ({} bytes): {}", record.len(), record.hex());
                    println!("  Text: {}", record.text_lossy());
                }
                Ok(SessionEvent::Error(kind)) => println!("Error: {:?}", kind),
                Ok(SessionEvent::Disconnected) => {
                    println!("Disconnected, reconnecting...");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    if let Err(e) = session.connect() {
                        println!("Reconnect failed: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => println!("Missed {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    session.close();
    Ok(())
}
