//! High-level management of a CozyLife device fleet.
//! Merges discovered and configured addresses, shares one catalog, and owns one session per IP.

use crate::catalog::{Catalog, DEFAULT_CATALOG_URL, DEFAULT_LANGUAGE, TypeCode};
use crate::device::{DeviceSession, SessionBuilder};
use crate::error::{CozyError, Result};
use crate::protocol::DEVICE_PORT;
use crate::scanner::Scanner;
use futures_util::future::join_all;
use log::{info, warn};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 2000;

/// Fleet settings, typically read from the host's configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Addresses to connect to in addition to the discovered ones
    pub ips: Vec<IpAddr>,
    /// Catalog language
    pub lang: String,
    /// Broadcast discovery on start
    pub discover: bool,
    /// Discovery receive budget in milliseconds
    pub discovery_timeout_ms: u64,
    /// Catalog service host
    pub catalog_url: String,
    /// Device TCP port
    pub port: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ips: Vec::new(),
            lang: DEFAULT_LANGUAGE.to_string(),
            discover: true,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            port: DEVICE_PORT,
        }
    }
}

impl ManagerConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

/// Concatenate address lists, keeping the first occurrence of each address.
pub fn merge_ips(discovered: &[IpAddr], configured: &[IpAddr]) -> Vec<IpAddr> {
    let mut merged: Vec<IpAddr> = Vec::with_capacity(discovered.len() + configured.len());
    for ip in discovered.iter().chain(configured) {
        if !merged.contains(ip) {
            merged.push(*ip);
        }
    }
    merged
}

/// Owns the sessions of every known device.
///
/// Cloning is cheap; all clones share the same sessions. Sessions are closed on
/// [`release`](Self::release), [`shutdown`](Self::shutdown), or when the last
/// handle to them is dropped.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    catalog: Arc<Catalog>,
    sessions: RwLock<Vec<DeviceSession>>,
}

impl Manager {
    /// Maximizes the file descriptor limit for the current process.
    ///
    /// Each session holds one socket, so large fleets can hit the default soft limit
    /// on Unix-like systems. On non-Unix systems, this does nothing.
    pub fn maximize_fd_limit() -> Result<()> {
        #[cfg(unix)]
        {
            let (soft, hard) = rlimit::getrlimit(rlimit::Resource::NOFILE)
                .map_err(|e| CozyError::Io(format!("Failed to get rlimit: {}", e)))?;

            if soft < hard {
                rlimit::setrlimit(rlimit::Resource::NOFILE, hard, hard)
                    .map_err(|e| CozyError::Io(format!("Failed to set rlimit: {}", e)))?;
                info!("File descriptor limit increased from {} to {}", soft, hard);
            }
        }
        Ok(())
    }

    /// Discover devices (if enabled), warm the catalog, and open one session per address.
    pub async fn start(config: ManagerConfig) -> Self {
        let catalog = Arc::new(Catalog::with_base_url(config.catalog_url.clone()));
        Self::start_with_catalog(config, catalog).await
    }

    /// Like [`start`](Self::start) but with an existing catalog.
    pub async fn start_with_catalog(config: ManagerConfig, catalog: Arc<Catalog>) -> Self {
        let discovered = if config.discover {
            Scanner::new()
                .with_timeout(config.discovery_timeout())
                .discover()
                .await
        } else {
            Vec::new()
        };
        let ips = merge_ips(&discovered, &config.ips);
        info!(
            "Starting manager for {} devices ({} discovered, {} configured)",
            ips.len(),
            discovered.len(),
            config.ips.len()
        );

        let entries = catalog.get_or_fetch(&config.lang).await;
        if entries.is_empty() {
            warn!("Product catalog not available yet, devices will report unknown capabilities");
        }

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                catalog,
                sessions: RwLock::new(Vec::new()),
            }),
        };
        for ip in ips {
            manager.add(ip).await;
        }
        manager
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.inner.catalog.clone()
    }

    /// Open a session with `ip`. Returns the existing one if the address is already managed.
    pub async fn add(&self, ip: IpAddr) -> DeviceSession {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(existing) = sessions.iter().find(|s| s.ip() == ip) {
            return existing.clone();
        }

        let session = SessionBuilder::new(ip)
            .port(self.inner.config.port)
            .catalog(self.inner.catalog.clone())
            .language(self.inner.config.lang.clone())
            .build();
        sessions.push(session.clone());
        info!("Device at {} added to manager", ip);
        session
    }

    /// Wait for every session to become Ready. Returns how many did within `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> usize {
        let sessions = self.sessions().await;
        let results = join_all(sessions.iter().map(|s| s.wait_ready(timeout))).await;
        results.into_iter().filter(|ready| *ready).count()
    }

    /// All sessions, in the order their addresses were added.
    pub async fn sessions(&self) -> Vec<DeviceSession> {
        self.inner.sessions.read().await.clone()
    }

    /// Session whose handshake reported `device_id`.
    pub async fn get(&self, device_id: &str) -> Result<DeviceSession> {
        self.inner
            .sessions
            .read()
            .await
            .iter()
            .find(|s| s.device_id().as_deref() == Some(device_id))
            .cloned()
            .ok_or_else(|| CozyError::DeviceNotFound(device_id.to_string()))
    }

    pub async fn get_by_ip(&self, ip: IpAddr) -> Option<DeviceSession> {
        self.inner
            .sessions
            .read()
            .await
            .iter()
            .find(|s| s.ip() == ip)
            .cloned()
    }

    pub async fn lights(&self) -> Vec<DeviceSession> {
        self.by_type(TypeCode::Light).await
    }

    pub async fn switches(&self) -> Vec<DeviceSession> {
        self.by_type(TypeCode::Switch).await
    }

    async fn by_type(&self, type_code: TypeCode) -> Vec<DeviceSession> {
        self.inner
            .sessions
            .read()
            .await
            .iter()
            .filter(|s| s.type_code() == type_code)
            .cloned()
            .collect()
    }

    /// Close and forget the session with `ip`. Returns false if it was not managed.
    pub async fn release(&self, ip: IpAddr) -> bool {
        let removed = {
            let mut sessions = self.inner.sessions.write().await;
            sessions
                .iter()
                .position(|s| s.ip() == ip)
                .map(|idx| sessions.remove(idx))
        };

        match removed {
            Some(session) => {
                session.close().await;
                info!("Device at {} released", ip);
                true
            }
            None => {
                warn!("Attempted to release unmanaged device at {}", ip);
                false
            }
        }
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<DeviceSession> = self.inner.sessions.write().await.drain(..).collect();
        info!("Shutting down manager ({} sessions)", sessions.len());
        for session in sessions {
            session.close().await;
        }
    }
}
