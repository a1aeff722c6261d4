//! Basic example: a driver, a publication and a subscription in one process.
//!
//! This example shows:
//! - Running the driver conductor on its own thread
//! - Connecting a client with a dedicated conductor thread
//! - Offering messages and retrying on back-pressure
//! - Polling a subscription
//!
//! Run with: `RUST_LOG=debug cargo run --example basic -p strand`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strand::driver::{DriverConductor, DriverConfig};
use strand::prelude::*;
use strand::BackoffIdle;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // The driver and client share this directory.
    let dir = tempfile::tempdir()?;
    let mut driver = DriverConductor::launch(DriverConfig::new(dir.path()))?;

    let stop = Arc::new(AtomicBool::new(false));
    let driver_thread = thread::spawn({
        let stop = Arc::clone(&stop);
        move || {
            let mut idle = BackoffIdle::default();
            while !stop.load(Ordering::Acquire) {
                let work = driver.do_work(Instant::now());
                idle.idle(work);
            }
        }
    });

    let strand = Strand::connect(Context::new().dir(dir.path()))?;
    let subscription = strand.add_subscription("strand:ipc", 10)?;
    let publication = strand.add_publication("strand:ipc", 10)?;
    println!(
        "publication {} (session {}) on {}",
        publication.registration_id(),
        publication.session_id(),
        publication.channel()
    );

    // Wait for the subscription to see the publication's image.
    while !subscription.is_connected() {
        thread::sleep(Duration::from_millis(1));
    }

    let mut idle = BackoffIdle::default();
    for i in 0..10 {
        let message = format!("hello #{i}");
        loop {
            match publication.offer(message.as_bytes())? {
                OfferOutcome::Published { position } => {
                    println!("sent {message:?}, position {position}");
                    break;
                }
                OfferOutcome::Rotated | OfferOutcome::PartitionNotFree => idle.idle(0),
            }
        }
    }

    let mut received = 0;
    while received < 10 {
        received += subscription.poll(
            |payload, header| {
                println!(
                    "received {:?} from session {}",
                    String::from_utf8_lossy(payload),
                    header.session_id
                );
            },
            10,
        );
    }

    drop(strand);
    stop.store(true, Ordering::Release);
    driver_thread.join().map_err(|_| "driver thread panicked")?;
    Ok(())
}
