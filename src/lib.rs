//! # CozyLife
//!
//! Asynchronous local-network control of CozyLife smart switches and lights.
//! Devices are found with a UDP broadcast, then driven over a line-delimited JSON
//! protocol on TCP port 5555. Capabilities come from the vendor's product catalog.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cozylife::{Catalog, DeviceSession, protocol::dpid};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() {
//! let catalog = Arc::new(Catalog::new());
//! for ip in cozylife::scanner::discover(Duration::from_secs(2)).await {
//!     let light = DeviceSession::connect(ip, catalog.clone());
//!     if light.wait_ready(Duration::from_secs(5)).await {
//!         light.control(&[(dpid::SWITCH, 255)].into()).await;
//!         println!("{:?}", light.query().await);
//!     }
//! }
//! # }
//! ```
//!
pub mod catalog;
pub mod device;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod scanner;

pub use catalog::{CapabilityProfile, Catalog, TypeCode};
pub use device::{DeviceIdentity, DeviceSession, SessionBuilder, SessionState};
pub use error::CozyError;
pub use manager::{Manager, ManagerConfig};
pub use protocol::{CommandKind, DataPointMap};
pub use scanner::Scanner;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
