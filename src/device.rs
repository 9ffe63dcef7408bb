//! Individual device session.
//! Handles the TCP connection, INFO handshake, correlated request/reply flow, and reconnects.

use crate::catalog::{CapabilityProfile, Catalog, DEFAULT_LANGUAGE, TypeCode};
use crate::error::{CozyError, Result};
use crate::protocol::{
    Codec, CommandKind, DEVICE_PORT, DataPointMap, Envelope, FrameBuffer, match_frame,
};
use futures_core::stream::Stream;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const READ_ATTEMPTS: usize = 10;
const READ_CHUNK: usize = 1024;
const CHAN_MPSC_CAPACITY: usize = 32;

const KEY_DID: &str = "did";
const KEY_PID: &str = "pid";
const KEY_MAC: &str = "mac";
const KEY_IP: &str = "ip";
const KEY_SV: &str = "sv";
const KEY_HV: &str = "hv";

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
}

/// Identity reported by the device in its INFO reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub product_id: String,
    pub mac: String,
    pub ip: String,
    pub firmware_version: String,
    pub hardware_version: String,
    pub protocol_version: u8,
}

impl DeviceIdentity {
    /// Extract the identity from an INFO reply. Both `did` and `pid` must be non-empty.
    pub fn from_info(env: &Envelope) -> Option<Self> {
        let msg = env.msg_object()?;
        let field = |key: &str| {
            msg.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let device_id = field(KEY_DID);
        let product_id = field(KEY_PID);
        if device_id.is_empty() || product_id.is_empty() {
            return None;
        }

        Some(Self {
            device_id,
            product_id,
            mac: field(KEY_MAC),
            ip: field(KEY_IP),
            firmware_version: field(KEY_SV),
            hardware_version: field(KEY_HV),
            protocol_version: env.pv,
        })
    }
}

/// Builder for [`DeviceSession`].
pub struct SessionBuilder {
    ip: IpAddr,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    reconnect_delay: Duration,
    read_attempts: usize,
    catalog: Option<Arc<Catalog>>,
    language: String,
}

impl SessionBuilder {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            port: DEVICE_PORT,
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
            read_attempts: READ_ATTEMPTS,
            catalog: None,
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Timeout of a single socket read or write.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Fixed pause between failed connection attempts.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// How many frames a request may examine before giving up on its reply.
    pub fn read_attempts(mut self, attempts: usize) -> Self {
        self.read_attempts = attempts.max(1);
        self
    }

    /// Shared product catalog. Without one the session creates its own.
    pub fn catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Language used if the catalog has to be fetched.
    pub fn language<L: Into<String>>(mut self, language: L) -> Self {
        self.language = language.into();
        self
    }

    /// Spawn the session's connection task. Must be called within a tokio runtime.
    pub fn build(self) -> DeviceSession {
        DeviceSession::with_builder(self)
    }
}

struct SessionConfig {
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    reconnect_delay: Duration,
    read_attempts: usize,
    language: String,
}

/// Internal commands for the background connection task.
enum SessionCommand {
    Query {
        resp_tx: oneshot::Sender<DataPointMap>,
    },
    Control {
        data: DataPointMap,
        resp_tx: oneshot::Sender<bool>,
    },
}

/// Session data that needs to be shared and mutable.
#[derive(Default)]
struct SessionShared {
    identity: Option<DeviceIdentity>,
    profile: CapabilityProfile,
    last_sn: Option<String>,
}

/// One live TCP connection plus its framing and token state.
struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    frames: FrameBuffer,
    codec: Codec,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            frames: FrameBuffer::new(),
            codec: Codec::new(),
        }
    }

    /// Encode and write one request; returns its correlation token.
    async fn send(
        &mut self,
        cmd: CommandKind,
        payload: &DataPointMap,
        write_timeout: Duration,
    ) -> Result<String> {
        let frame = self.codec.encode(cmd, payload)?;
        timeout(write_timeout, self.writer.write_all(&frame))
            .await
            .map_err(|_| CozyError::Timeout)??;
        self.codec
            .expected_sn()
            .map(str::to_owned)
            .ok_or(CozyError::InvalidPayload)
    }

    /// Read once from the socket into the frame buffer.
    ///
    /// Cancel safe: bytes are only buffered after the read completes.
    async fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(CozyError::Io("Connection closed by device".to_string()));
        }
        self.frames.extend(&chunk[..n]);
        Ok(n)
    }

    /// Examine up to `attempts` frames looking for the reply carrying `sn`.
    async fn read_reply(
        &mut self,
        sn: &str,
        attempts: usize,
        read_timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let mut remaining = attempts;
        while remaining > 0 {
            let Some(frame) = self.frames.next_frame() else {
                timeout(read_timeout, self.fill())
                    .await
                    .map_err(|_| CozyError::Timeout)??;
                continue;
            };
            remaining -= 1;
            if let Some(env) = match_frame(&frame, sn) {
                return Ok(Some(env));
            }
        }
        Ok(None)
    }
}

/// A session with one CozyLife device.
///
/// The handle is cheap to clone. A background task owns the socket and cycles through
/// Connecting → Handshaking → Ready, reconnecting whenever the connection fails.
/// Dropping every handle (or calling [`close`](Self::close)) stops the task and closes
/// the socket.
#[derive(Clone)]
pub struct DeviceSession {
    ip: IpAddr,
    config: Arc<SessionConfig>,
    catalog: Arc<Catalog>,

    // Shared mutable state
    shared: Arc<RwLock<SessionShared>>,
    state_tx: Arc<watch::Sender<SessionState>>,

    // Channel to send commands to the background task
    tx: Option<mpsc::Sender<SessionCommand>>,

    // Token for stopping the session and its background task
    cancel_token: CancellationToken,
}

impl DeviceSession {
    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Start a session with the device at `ip` using the default settings.
    pub fn connect(ip: IpAddr, catalog: Arc<Catalog>) -> Self {
        SessionBuilder::new(ip).catalog(catalog).build()
    }

    pub fn builder(ip: IpAddr) -> SessionBuilder {
        SessionBuilder::new(ip)
    }

    pub(crate) fn with_builder(builder: SessionBuilder) -> Self {
        let (tx, rx) = mpsc::channel(CHAN_MPSC_CAPACITY);
        let (state_tx, _) = watch::channel(SessionState::Disconnected);

        let session = Self {
            ip: builder.ip,
            config: Arc::new(SessionConfig {
                port: builder.port,
                connect_timeout: builder.connect_timeout,
                read_timeout: builder.read_timeout,
                reconnect_delay: builder.reconnect_delay,
                read_attempts: builder.read_attempts,
                language: builder.language,
            }),
            catalog: builder.catalog.unwrap_or_default(),
            shared: Arc::new(RwLock::new(SessionShared::default())),
            state_tx: Arc::new(state_tx),
            tx: Some(tx),
            cancel_token: CancellationToken::new(),
        };

        let s_clone = session.clone();
        tokio::spawn(async move { s_clone.run_connection_task(rx).await });
        session
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Wait until the session is Ready. Returns false on timeout.
    pub async fn wait_ready(&self, wait: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        matches!(
            timeout(wait, rx.wait_for(|s| *s == SessionState::Ready)).await,
            Ok(Ok(_))
        )
    }

    /// Returns a Stream of state transitions, starting with the current state.
    ///
    /// Transitions that happen faster than the stream is polled may be coalesced.
    pub fn state_changes(&self) -> impl Stream<Item = SessionState> + Send + 'static {
        let mut rx = self.state_tx.subscribe();
        async_stream::stream! {
            let current = *rx.borrow_and_update();
            yield current;
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                yield state;
            }
        }
    }

    /// Identity from the last successful handshake.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.shared.read().identity.clone()
    }

    /// Device id from the last successful handshake. Always `Some` once Ready.
    pub fn device_id(&self) -> Option<String> {
        self.shared
            .read()
            .identity
            .as_ref()
            .map(|i| i.device_id.clone())
    }

    pub fn profile(&self) -> CapabilityProfile {
        self.shared.read().profile.clone()
    }

    pub fn type_code(&self) -> TypeCode {
        self.shared.read().profile.type_code.clone()
    }

    pub fn model_name(&self) -> String {
        self.shared.read().profile.model_name.clone()
    }

    pub fn icon(&self) -> String {
        self.shared.read().profile.icon.clone()
    }

    pub fn supported_data_points(&self) -> BTreeSet<u32> {
        self.shared.read().profile.supported_data_points.clone()
    }

    /// Correlation token of the most recent request sent on this session.
    pub fn last_sn(&self) -> Option<String> {
        self.shared.read().last_sn.clone()
    }

    /// Stops the session and waits until its socket is closed. No protocol message is sent.
    pub async fn close(&self) {
        info!("Closing session with device at {}", self.ip);
        self.cancel_token.cancel();
        if let Some(tx) = &self.tx {
            // The task owns the receiver; it is dropped when the task exits.
            tx.closed().await;
        }
        self.set_state(SessionState::Disconnected);
    }
}

// -------------------------------------------------------------------------
// Device Control API
// -------------------------------------------------------------------------
impl DeviceSession {
    /// Queries the current data point values of the device.
    ///
    /// Returns an empty map when the session is not Ready, when no correlated reply
    /// shows up within the read budget, or when the connection fails (the session
    /// then reconnects in the background).
    pub async fn query(&self) -> DataPointMap {
        let (resp_tx, resp_rx) = oneshot::channel();
        if let Err(e) = self.send_to_task(SessionCommand::Query { resp_tx }).await {
            debug!("Query skipped for {}: {}", self.ip, e);
            return DataPointMap::new();
        }
        resp_rx.await.unwrap_or_default()
    }

    /// Sets data points on the device without waiting for its acknowledgement.
    ///
    /// Returns true once the request was written. Issue a [`query`](Self::query)
    /// afterwards to observe the new state.
    pub async fn control(&self, payload: &DataPointMap) -> bool {
        let (resp_tx, resp_rx) = oneshot::channel();
        let cmd = SessionCommand::Control {
            data: payload.clone(),
            resp_tx,
        };
        if let Err(e) = self.send_to_task(cmd).await {
            debug!("Control skipped for {}: {}", self.ip, e);
            return false;
        }
        resp_rx.await.unwrap_or(false)
    }
}

// -------------------------------------------------------------------------
// Internal State Helpers
// -------------------------------------------------------------------------
impl DeviceSession {
    fn set_state(&self, state: SessionState) {
        // A closed session stays Disconnected.
        if self.cancel_token.is_cancelled() && state != SessionState::Disconnected {
            return;
        }
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!("Device at {}: {:?} -> {:?}", self.ip, prev, state);
        }
    }

    fn remember_sn(&self, sn: &str) {
        self.shared.write().last_sn = Some(sn.to_string());
    }

    /// Queue a request for the connection task. Fails with `Offline` unless Ready.
    async fn send_to_task(&self, cmd: SessionCommand) -> Result<()> {
        if !self.is_ready() {
            return Err(CozyError::Offline);
        }
        let Some(tx) = &self.tx else {
            error!("Cannot send command to {}: task handle missing", self.ip);
            return Err(CozyError::Offline);
        };
        tx.send(cmd).await.map_err(|e| {
            warn!("Failed to queue command for device at {}: {}", self.ip, e);
            CozyError::Offline
        })
    }
}

// -------------------------------------------------------------------------
// Background Connection Task
// -------------------------------------------------------------------------
impl DeviceSession {
    async fn run_connection_task(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        // Drop the internal sender so rx closes when all external handles are dropped.
        self.tx = None;
        debug!("Starting background connection task for {}", self.ip);

        tokio::select! {
            _ = self.cancel_token.cancelled() => {
                debug!("Background task for {} received stop signal", self.ip);
            }
            _ = self.connection_loop(&mut rx) => {
                debug!("All handles for {} dropped, stopping task", self.ip);
            }
        }

        self.set_state(SessionState::Disconnected);
        debug!("Background connection task for {} exited", self.ip);
    }

    async fn connection_loop(&self, rx: &mut mpsc::Receiver<SessionCommand>) {
        loop {
            self.set_state(SessionState::Connecting);

            match self.connect_and_handshake().await {
                Ok(mut conn) => {
                    self.set_state(SessionState::Ready);
                    match self.serve(&mut conn, rx).await {
                        Ok(()) => return,
                        Err(e) => {
                            warn!("Connection to device at {} lost: {}", self.ip, e);
                            // Reconnect right away; backoff only applies to failed attempts.
                        }
                    }
                }
                Err(e) => {
                    info!(
                        "Connection attempt to {} failed: {}. Retrying in {:?}",
                        self.ip, e, self.config.reconnect_delay
                    );
                    if self.wait_for_backoff(rx).await.is_none() {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep the reconnect delay, rejecting commands that arrive meanwhile.
    async fn wait_for_backoff(&self, rx: &mut mpsc::Receiver<SessionCommand>) -> Option<()> {
        let sleep_fut = sleep(self.config.reconnect_delay);
        tokio::pin!(sleep_fut);

        loop {
            tokio::select! {
                _ = &mut sleep_fut => return Some(()),
                cmd_opt = rx.recv() => {
                    let cmd = cmd_opt?;
                    debug!("Rejecting command during backoff for {}", self.ip);
                    Self::reject(cmd);
                }
            }
        }
    }

    fn reject(cmd: SessionCommand) {
        match cmd {
            SessionCommand::Query { resp_tx } => {
                let _ = resp_tx.send(DataPointMap::new());
            }
            SessionCommand::Control { resp_tx, .. } => {
                let _ = resp_tx.send(false);
            }
        }
    }

    async fn connect_and_handshake(&self) -> Result<Connection> {
        let addr = SocketAddr::new(self.ip, self.config.port);
        info!("Connecting to device at {}", addr);

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CozyError::Timeout)??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        let mut conn = Connection::new(stream);

        self.set_state(SessionState::Handshaking);
        let sn = conn
            .send(CommandKind::Info, &DataPointMap::new(), self.config.read_timeout)
            .await?;
        self.remember_sn(&sn);

        let reply = conn
            .read_reply(&sn, self.config.read_attempts, self.config.read_timeout)
            .await?
            .ok_or(CozyError::HandshakeFailed)?;
        let identity = DeviceIdentity::from_info(&reply).ok_or_else(|| {
            debug!("INFO reply from {} lacks did/pid: {:?}", addr, reply.msg);
            CozyError::HandshakeFailed
        })?;

        let profile = self
            .catalog
            .profile_for(&identity.product_id, &self.config.language)
            .await
            .unwrap_or_else(|| {
                warn!(
                    "No catalog entry for product {} (device {}), capabilities unknown",
                    identity.product_id, identity.device_id
                );
                CapabilityProfile::unknown()
            });

        info!(
            "Device {} ready at {} (product={}, type={:?}, model={})",
            identity.device_id, addr, identity.product_id, profile.type_code, profile.model_name
        );

        {
            let mut shared = self.shared.write();
            shared.identity = Some(identity);
            shared.profile = profile;
        }
        Ok(conn)
    }

    /// Serve commands on a Ready connection until it fails or all handles are dropped.
    async fn serve(
        &self,
        conn: &mut Connection,
        rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                cmd_opt = rx.recv() => {
                    match cmd_opt {
                        Some(cmd) => self.process_command(conn, cmd).await?,
                        None => return Ok(()),
                    }
                }
                res = conn.fill() => {
                    res?;
                    conn.frames.discard_frames();
                }
            }
        }
    }

    async fn process_command(&self, conn: &mut Connection, cmd: SessionCommand) -> Result<()> {
        match cmd {
            SessionCommand::Query { resp_tx } => match self.query_on(conn).await {
                Ok(data) => {
                    let _ = resp_tx.send(data);
                    Ok(())
                }
                Err(e) => {
                    self.set_state(SessionState::Connecting);
                    let _ = resp_tx.send(DataPointMap::new());
                    Err(e)
                }
            },
            SessionCommand::Control { data, resp_tx } => match self.control_on(conn, &data).await {
                Ok(()) => {
                    let _ = resp_tx.send(true);
                    Ok(())
                }
                Err(e) => {
                    self.set_state(SessionState::Connecting);
                    let _ = resp_tx.send(false);
                    Err(e)
                }
            },
        }
    }

    async fn query_on(&self, conn: &mut Connection) -> Result<DataPointMap> {
        conn.frames.discard_frames();
        let sn = conn
            .send(CommandKind::Query, &DataPointMap::new(), self.config.read_timeout)
            .await?;
        self.remember_sn(&sn);

        match conn
            .read_reply(&sn, self.config.read_attempts, self.config.read_timeout)
            .await?
        {
            Some(reply) => {
                let data = reply.data_points();
                debug!("Query reply from {}: {:?}", self.ip, data);
                Ok(data)
            }
            None => {
                warn!(
                    "No reply with sn={} from {} within {} frames",
                    sn, self.ip, self.config.read_attempts
                );
                Ok(DataPointMap::new())
            }
        }
    }

    async fn control_on(&self, conn: &mut Connection, data: &DataPointMap) -> Result<()> {
        let sn = conn
            .send(CommandKind::Set, data, self.config.read_timeout)
            .await?;
        self.remember_sn(&sn);
        debug!("Sent control {:?} to {} (sn={})", data, self.ip, sn);
        Ok(())
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        // External handles carry tx; the background task's copy does not.
        if self.tx.is_some() && Arc::strong_count(&self.shared) <= 2 {
            self.cancel_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CategoryEntry, ProductModel};
    use crate::protocol::dpid;
    use futures_util::StreamExt;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    const DID: &str = "629168597cb94c4c1d8f";

    type Peer = BufReader<TcpStream>;

    fn test_catalog() -> Arc<Catalog> {
        Arc::new(Catalog::from_entries(vec![CategoryEntry {
            type_code: TypeCode::Light,
            models: vec![ProductModel {
                product_id: "e2s64v".into(),
                icon: "bulb.png".into(),
                model_name: "Smart Bulb".into(),
                dpid: dpid::LIGHT_DPIDS.iter().copied().collect(),
            }],
        }]))
    }

    async fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    fn session_for(listener: &TcpListener, catalog: Arc<Catalog>) -> DeviceSession {
        DeviceSession::builder("127.0.0.1".parse().unwrap())
            .port(listener.local_addr().unwrap().port())
            .catalog(catalog)
            .read_timeout(Duration::from_secs(2))
            .reconnect_delay(Duration::from_millis(50))
            .build()
    }

    async fn accept(listener: &TcpListener) -> Peer {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        BufReader::new(stream)
    }

    async fn next_request(peer: &mut Peer) -> (Envelope, String) {
        let mut line = String::new();
        timeout(Duration::from_secs(5), peer.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert!(line.ends_with("\r\n"), "unterminated frame: {:?}", line);
        let env = Envelope::parse(line.trim_end().as_bytes()).unwrap();
        (env, line)
    }

    async fn send_line(peer: &mut Peer, line: &str) {
        peer.get_mut()
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    fn info_reply(sn: &str, pid: Option<&str>) -> String {
        let pid = pid.map(|p| format!(",\"pid\":\"{}\"", p)).unwrap_or_default();
        format!(
            r#"{{"cmd":0,"pv":0,"sn":"{}","msg":{{"did":"{}","dtp":"02"{},"mac":"7cb94c4c1d8f","ip":"192.168.123.57","rssi":-33,"sv":"1.0.0","hv":"0.0.1"}},"res":0}}"#,
            sn, DID, pid
        )
    }

    fn data_reply(cmd: u8, sn: &str, data: &str) -> String {
        format!(
            r#"{{"cmd":{},"pv":0,"sn":"{}","msg":{{"attr":[1,2,3,4,5,6],"data":{}}},"res":0}}"#,
            cmd, sn, data
        )
    }

    async fn handshake(peer: &mut Peer) {
        let (req, _) = next_request(peer).await;
        assert_eq!(req.kind(), Some(CommandKind::Info));
        assert_eq!(req.msg, serde_json::json!({}));
        send_line(peer, &info_reply(&req.sn, Some("e2s64v"))).await;
    }

    async fn ready_session(catalog: Arc<Catalog>) -> (TcpListener, DeviceSession, Peer) {
        let listener = listener().await;
        let session = session_for(&listener, catalog);
        let mut peer = accept(&listener).await;
        handshake(&mut peer).await;
        assert!(session.wait_ready(Duration::from_secs(5)).await);
        (listener, session, peer)
    }

    #[tokio::test]
    async fn handshake_makes_session_ready() {
        let listener = listener().await;
        let session = session_for(&listener, test_catalog());
        assert!(session.device_id().is_none());

        let mut peer = accept(&listener).await;
        handshake(&mut peer).await;

        assert!(session.wait_ready(Duration::from_secs(5)).await);
        assert_eq!(session.device_id().as_deref(), Some(DID));
        assert_eq!(session.type_code(), TypeCode::Light);
        assert_eq!(session.model_name(), "Smart Bulb");
        assert_eq!(session.icon(), "bulb.png");
        assert!(session.supported_data_points().contains(&dpid::HUE));

        let identity = session.identity().unwrap();
        assert_eq!(identity.product_id, "e2s64v");
        assert_eq!(identity.mac, "7cb94c4c1d8f");
        assert_eq!(identity.firmware_version, "1.0.0");
        assert_eq!(identity.protocol_version, 0);
    }

    #[tokio::test]
    async fn incomplete_identity_retries_handshake() {
        let listener = listener().await;
        let session = session_for(&listener, test_catalog());

        let mut first = accept(&listener).await;
        let (req, _) = next_request(&mut first).await;
        send_line(&mut first, &info_reply(&req.sn, None)).await;

        let mut second = accept(&listener).await;
        assert!(!session.is_ready());
        assert!(session.device_id().is_none());
        handshake(&mut second).await;

        assert!(session.wait_ready(Duration::from_secs(5)).await);
        assert_eq!(session.device_id().as_deref(), Some(DID));
    }

    #[tokio::test]
    async fn unknown_product_still_becomes_ready() {
        let catalog = Arc::new(Catalog::from_entries(Vec::new()));
        let (_listener, session, _peer) = ready_session(catalog).await;

        assert_eq!(session.device_id().as_deref(), Some(DID));
        assert_eq!(session.type_code(), TypeCode::Unknown);
        assert!(!session.profile().is_known());
        assert!(session.supported_data_points().is_empty());
    }

    #[tokio::test]
    async fn control_writes_set_frame() {
        let (_listener, session, mut peer) = ready_session(test_catalog()).await;

        assert!(session.control(&DataPointMap::from([(dpid::SWITCH, 0)])).await);

        let (req, line) = next_request(&mut peer).await;
        assert!(line.contains("\"cmd\":3"));
        assert!(line.contains("\"data\":{\"1\":0}"));
        assert_eq!(req.msg["attr"], serde_json::json!([1]));
        assert_eq!(session.last_sn(), Some(req.sn));
    }

    #[tokio::test]
    async fn query_skips_interleaved_frames() {
        let (_listener, session, mut peer) = ready_session(test_catalog()).await;

        let device = tokio::spawn(async move {
            let (req, _) = next_request(&mut peer).await;
            assert_eq!(req.kind(), Some(CommandKind::Query));
            assert_eq!(req.msg, serde_json::json!({"attr": [0]}));
            for i in 0..9 {
                let line = if i % 2 == 0 {
                    data_reply(10, "1636463664000", r#"{"1":255}"#)
                } else {
                    data_reply(2, "1", r#"{"1":255}"#)
                };
                send_line(&mut peer, &line).await;
            }
            send_line(&mut peer, &data_reply(2, &req.sn, r#"{"1":0,"4":1000}"#)).await;
            peer
        });

        let state = session.query().await;
        assert_eq!(state, DataPointMap::from([(1, 0), (4, 1000)]));
        assert!(session.is_ready());
        let _peer = device.await.unwrap();
    }

    #[tokio::test]
    async fn query_gives_up_after_read_budget() {
        let (_listener, session, mut peer) = ready_session(test_catalog()).await;

        let device = tokio::spawn(async move {
            let (req, _) = next_request(&mut peer).await;
            for _ in 0..READ_ATTEMPTS {
                send_line(&mut peer, &data_reply(10, "1", r#"{"1":255}"#)).await;
            }
            send_line(&mut peer, &data_reply(2, &req.sn, r#"{"1":0}"#)).await;
            peer
        });

        assert!(session.query().await.is_empty());
        assert!(session.is_ready());
        let _peer = device.await.unwrap();
    }

    #[tokio::test]
    async fn read_error_reconnects() {
        let (listener, session, mut peer) = ready_session(test_catalog()).await;

        let device = tokio::spawn(async move {
            let (req, _) = next_request(&mut peer).await;
            assert_eq!(req.kind(), Some(CommandKind::Query));
            drop(peer);
        });

        assert!(session.query().await.is_empty());
        assert_ne!(session.state(), SessionState::Ready);
        device.await.unwrap();

        let mut again = accept(&listener).await;
        handshake(&mut again).await;
        assert!(session.wait_ready(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn unsolicited_reports_do_not_disturb_next_query() {
        let (_listener, session, mut peer) = ready_session(test_catalog()).await;

        for _ in 0..3 {
            send_line(&mut peer, &data_reply(10, "1636463664000", r#"{"1":255}"#)).await;
        }
        sleep(Duration::from_millis(100)).await;

        let device = tokio::spawn(async move {
            let (req, _) = next_request(&mut peer).await;
            send_line(&mut peer, &data_reply(2, &req.sn, r#"{"1":255,"4":500}"#)).await;
            peer
        });

        assert_eq!(
            session.query().await,
            DataPointMap::from([(1, 255), (4, 500)])
        );
        let _peer = device.await.unwrap();
    }

    #[tokio::test]
    async fn requests_before_ready_are_rejected() {
        let listener = listener().await;
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = DeviceSession::builder("127.0.0.1".parse().unwrap())
            .port(port)
            .catalog(test_catalog())
            .reconnect_delay(Duration::from_millis(50))
            .build();

        assert!(session.query().await.is_empty());
        assert!(!session.control(&DataPointMap::from([(1, 255)])).await);
        assert!(!session.wait_ready(Duration::from_millis(200)).await);
        assert!(session.device_id().is_none());
    }

    #[tokio::test]
    async fn close_drops_connection() {
        let (_listener, session, mut peer) = ready_session(test_catalog()).await;

        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), peer.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(session.query().await.is_empty());
    }

    #[tokio::test]
    async fn silent_device_times_out_and_reconnects() {
        let listener = listener().await;
        let session = DeviceSession::builder("127.0.0.1".parse().unwrap())
            .port(listener.local_addr().unwrap().port())
            .catalog(test_catalog())
            .read_timeout(Duration::from_millis(300))
            .reconnect_delay(Duration::from_millis(50))
            .build();

        let mut peer = accept(&listener).await;
        handshake(&mut peer).await;
        assert!(session.wait_ready(Duration::from_secs(5)).await);

        let device = tokio::spawn(async move {
            let (req, _) = next_request(&mut peer).await;
            assert_eq!(req.kind(), Some(CommandKind::Query));
            // Stay connected but never answer.
            peer
        });

        assert!(session.query().await.is_empty());
        assert_ne!(session.state(), SessionState::Ready);
        let _silent = device.await.unwrap();

        let mut again = accept(&listener).await;
        handshake(&mut again).await;
        assert!(session.wait_ready(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn dropping_last_handle_closes_socket() {
        let (_listener, session, mut peer) = ready_session(test_catalog()).await;

        let other = session.clone();
        drop(session);
        assert!(other.is_ready());
        drop(other);

        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), peer.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn requests_are_offline_until_ready() {
        let listener = listener().await;
        let session = session_for(&listener, test_catalog());

        let (resp_tx, _resp_rx) = oneshot::channel();
        let res = session.send_to_task(SessionCommand::Query { resp_tx }).await;
        assert!(matches!(res, Err(CozyError::Offline)));
    }

    #[tokio::test]
    async fn state_stream_reaches_ready() {
        let listener = listener().await;
        let session = session_for(&listener, test_catalog());
        let mut states = Box::pin(session.state_changes());

        let mut peer = accept(&listener).await;
        handshake(&mut peer).await;

        let reached = timeout(Duration::from_secs(5), async {
            while let Some(state) = states.next().await {
                if state == SessionState::Ready {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(reached);
    }

    #[test]
    fn identity_requires_did_and_pid() {
        let env = Envelope::parse(br#"{"cmd":0,"sn":"1","msg":{"did":"","pid":"x"}}"#).unwrap();
        assert!(DeviceIdentity::from_info(&env).is_none());

        let env = Envelope::parse(br#"{"cmd":0,"sn":"1","msg":"oops"}"#).unwrap();
        assert!(DeviceIdentity::from_info(&env).is_none());

        let env = Envelope::parse(br#"{"cmd":0,"sn":"1","msg":{"did":"a","pid":"b"}}"#).unwrap();
        let identity = DeviceIdentity::from_info(&env).unwrap();
        assert_eq!(identity.device_id, "a");
        assert!(identity.mac.is_empty());
    }
}
