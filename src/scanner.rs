//! UDP-based device discovery.
//! Broadcasts an INFO probe and collects the addresses of every device that answers.

use crate::error::Result;
use crate::protocol::{Codec, CommandKind, DISCOVERY_PORT, DataPointMap};
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant, sleep, timeout};

const PROBE_COUNT: usize = 3;
const PROBE_INTERVAL: Duration = Duration::from_millis(30);
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_REPLIES: usize = 255;
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(2);

/// Scanner finds devices on the local broadcast domain.
///
/// Reply contents are ignored: any datagram coming back identifies a live device
/// at the sender's address.
#[derive(Debug, Clone)]
pub struct Scanner {
    /// Budget for the receive window after the probes are sent
    pub timeout: Duration,
    /// Local address to bind to
    pub bind_addr: String,
    /// Where probes are sent (default: 255.255.255.255:6095)
    pub target: SocketAddr,
    /// Timeout of a single receive call
    pub recv_timeout: Duration,
    /// Stop once this many distinct devices answered
    pub max_replies: usize,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    /// Create a new Scanner with default settings.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_SCAN_TIMEOUT,
            bind_addr: "0.0.0.0".to_string(),
            target: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DISCOVERY_PORT),
            recv_timeout: RECV_TIMEOUT,
            max_replies: MAX_REPLIES,
        }
    }

    /// Set the receive budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the local bind address.
    pub fn with_bind_addr<A: Into<String>>(mut self, bind_addr: A) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    /// Send probes somewhere other than the limited broadcast address.
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;
        self
    }

    pub fn with_recv_timeout(mut self, recv_timeout: Duration) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }

    pub fn with_max_replies(mut self, max_replies: usize) -> Self {
        self.max_replies = max_replies;
        self
    }

    /// Create a broadcast-capable UDP socket on an ephemeral port.
    fn create_socket(&self) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:0", self.bind_addr)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        debug!("Creating discovery socket on {}...", addr);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on discovery socket: {}", e);
        }

        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on discovery socket: {}", e);
        }

        if let Err(e) = socket.bind(&SockAddr::from(addr)) {
            error!("Failed to bind discovery socket to {}: {}", addr, e);
            return Err(e.into());
        }

        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Send the INFO probe [`PROBE_COUNT`] times, [`PROBE_INTERVAL`] apart.
    async fn send_probes(&self, socket: &UdpSocket) -> Result<()> {
        let probe = Codec::new().encode(CommandKind::Info, &DataPointMap::new())?;
        for i in 0..PROBE_COUNT {
            if i > 0 {
                sleep(PROBE_INTERVAL).await;
            }
            let len = socket.send_to(&probe, self.target).await?;
            debug!("Sent discovery probe {} to {}: {} bytes", i + 1, self.target, len);
        }
        Ok(())
    }

    /// Scans the local network for devices.
    ///
    /// Returns distinct device addresses in the order they first answered. Never
    /// fails: a socket error ends the scan early with whatever was collected.
    pub async fn discover(&self) -> Vec<IpAddr> {
        info!(
            "Starting device scan (target: {}, budget: {:?})...",
            self.target, self.timeout
        );

        let mut found = Vec::new();
        if let Err(e) = self.scan_into(&mut found).await {
            warn!("Discovery aborted after {} replies: {}", found.len(), e);
        }

        info!("Scan finished. Found {} devices.", found.len());
        found
    }

    async fn scan_into(&self, found: &mut Vec<IpAddr>) -> Result<()> {
        let socket = self.create_socket()?;
        self.send_probes(&socket).await?;

        let start = Instant::now();
        let mut buf = [0u8; 1024];

        while found.len() < self.max_replies {
            let remaining = self.timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }

            match timeout(self.recv_timeout.min(remaining), socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok((len, addr))) => {
                    debug!("Received discovery reply from {}: {} bytes", addr, len);
                    let ip = addr.ip();
                    if !found.contains(&ip) {
                        info!("Discovered device at {}", ip);
                        found.push(ip);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Discover device addresses on the local network within `budget`.
pub async fn discover(budget: Duration) -> Vec<IpAddr> {
    Scanner::new().with_timeout(budget).discover().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, FrameBuffer};
    use std::sync::Arc;

    /// Fake device: records probes, then answers from `reply_from` sockets in order.
    async fn fake_device(reply_from: Vec<&'static str>) -> (SocketAddr, tokio::task::JoinHandle<Vec<Instant>>) {
        let device = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = device.local_addr().unwrap();

        let mut responders = Vec::new();
        for ip in reply_from {
            if ip == "127.0.0.1" {
                responders.push(device.clone());
            } else {
                responders.push(Arc::new(UdpSocket::bind(format!("{}:0", ip)).await.unwrap()));
            }
        }

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let mut arrivals = Vec::new();
            let mut scanner_addr = None;
            while arrivals.len() < PROBE_COUNT {
                let (len, from) = device.recv_from(&mut buf).await.unwrap();
                let mut frames = FrameBuffer::new();
                frames.extend(&buf[..len]);
                let env = Envelope::parse(&frames.next_frame().unwrap()).unwrap();
                assert_eq!(env.kind(), Some(CommandKind::Info));
                arrivals.push(Instant::now());
                scanner_addr = Some(from);
            }
            let to = scanner_addr.unwrap();
            for responder in responders {
                responder.send_to(b"{\"cmd\":0}", to).await.unwrap();
            }
            arrivals
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn duplicate_replies_collapse_to_unique_addresses() {
        let (addr, device) = fake_device(vec!["127.0.0.1", "127.0.0.2", "127.0.0.1"]).await;

        let found = Scanner::new()
            .with_bind_addr("127.0.0.1")
            .with_target(addr)
            .with_timeout(Duration::from_millis(500))
            .discover()
            .await;

        assert_eq!(
            found,
            vec![
                "127.0.0.1".parse::<IpAddr>().unwrap(),
                "127.0.0.2".parse::<IpAddr>().unwrap()
            ]
        );

        let arrivals = device.await.unwrap();
        assert_eq!(arrivals.len(), 3);
        for pair in arrivals.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn stops_at_max_replies() {
        let (addr, _device) = fake_device(vec!["127.0.0.1", "127.0.0.2"]).await;

        let start = Instant::now();
        let found = Scanner::new()
            .with_bind_addr("127.0.0.1")
            .with_target(addr)
            .with_timeout(Duration::from_secs(5))
            .with_max_replies(1)
            .discover()
            .await;

        assert_eq!(found.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn silent_network_respects_budget() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let budget = Duration::from_millis(300);

        let start = Instant::now();
        let found = Scanner::new()
            .with_bind_addr("127.0.0.1")
            .with_target(silent.local_addr().unwrap())
            .with_timeout(budget)
            .discover()
            .await;

        assert!(found.is_empty());
        let elapsed = start.elapsed();
        assert!(elapsed >= budget);
        assert!(elapsed < budget + Duration::from_millis(400));
    }

    #[tokio::test]
    async fn socket_errors_yield_empty_result() {
        let found = Scanner::new()
            .with_bind_addr("not-an-address")
            .with_timeout(Duration::from_millis(100))
            .discover()
            .await;
        assert!(found.is_empty());
    }
}
