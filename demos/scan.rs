/**
 * Scanner Example
 *
 * Broadcasts the discovery probe and connects to every device that answers,
 * printing its identity and catalog profile.
 */
use cozylife::{Catalog, DeviceSession};
use std::sync::Arc;
use tokio::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();
    println!("--- CozyLife - Scanner ---");
    println!("[INFO] Scanning the network for CozyLife devices...");

    let ips = cozylife::scanner::discover(Duration::from_secs(2)).await;
    println!("[INFO] Scan finished. Total devices found: {}", ips.len());

    let catalog = Arc::new(Catalog::new());
    for (i, ip) in ips.into_iter().enumerate() {
        let session = DeviceSession::connect(ip, catalog.clone());
        if !session.wait_ready(Duration::from_secs(5)).await {
            println!("[{}] {} did not complete the handshake", i + 1, ip);
            continue;
        }

        let profile = session.profile();
        println!(
            "[{}] Found Device: ID={}, IP={}, Type={:?}, Model={}, DPs={:?}",
            i + 1,
            session.device_id().unwrap_or_default(),
            ip,
            profile.type_code,
            profile.model_name,
            profile.supported_data_points
        );
        session.close().await;
    }
}
