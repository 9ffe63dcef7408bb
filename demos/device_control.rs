/**
 * Device Control Example
 *
 * Connects to a device by IP, switches it on and off, and queries its state.
 * Usage: cargo run --example device_control -- 192.168.1.50
 */
use cozylife::protocol::dpid;
use cozylife::{Catalog, DataPointMap, DeviceSession};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::{Duration, sleep};

#[tokio::main]
async fn main() {
    env_logger::init();
    println!("--- CozyLife - Device Control ---");

    let Some(ip) = std::env::args().nth(1).and_then(|a| a.parse::<IpAddr>().ok()) else {
        eprintln!("[ERROR] Pass the device IP address as the first argument");
        return;
    };

    // 1. Connect and wait for the handshake
    let device = DeviceSession::connect(ip, Arc::new(Catalog::new()));
    if !device.wait_ready(Duration::from_secs(10)).await {
        eprintln!("[ERROR] Device at {} is not reachable", ip);
        return;
    }
    println!(
        "[INFO] Connected to {} ({:?})",
        device.device_id().unwrap_or_default(),
        device.type_code()
    );

    // 2. Switch on
    println!("[STEP 1] Switching ON...");
    let on = DataPointMap::from([(dpid::SWITCH, 255)]);
    if !device.control(&on).await {
        eprintln!("[ERROR] Control failed");
    }

    sleep(Duration::from_secs(1)).await;

    // 3. Switch off, with brightness for lights
    println!("[STEP 2] Switching OFF...");
    let mut off = DataPointMap::from([(dpid::SWITCH, 0)]);
    if device.profile().supports(dpid::BRIGHT) {
        off.insert(dpid::BRIGHT, 500);
    }
    if !device.control(&off).await {
        eprintln!("[ERROR] Control failed");
    }

    // 4. Query status
    println!("[STEP 3] Querying current status...");
    let state = device.query().await;
    if state.is_empty() {
        println!("[INFO] No status data received");
    } else {
        println!("[SUCCESS] Status: {:?}", state);
    }

    device.close().await;
    println!("[INFO] Example finished.");
}
