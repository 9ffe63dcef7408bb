//! CozyLife wire protocol implementation.
//! Handles envelope building, CR-LF framing, and sequence-token correlation.

use crate::error::{CozyError, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// TCP port every device listens on for control sessions.
pub const DEVICE_PORT: u16 = 5555;
/// UDP port devices answer discovery probes on.
pub const DISCOVERY_PORT: u16 = 6095;
/// Value of the `pv` field; the protocol has a single revision.
pub const PROTOCOL_VERSION: u8 = 0;
/// Every frame on the wire ends with this delimiter.
pub const FRAME_DELIMITER: &[u8] = b"\r\n";

/// `attr` sentinel asking the device for every attribute it knows.
const QUERY_ALL_ATTRS: u32 = 0;
/// Frames longer than this without a delimiter are considered garbage.
const MAX_FRAME_LEN: usize = 64 * 1024;

const KEY_ATTR: &str = "attr";
const KEY_DATA: &str = "data";

/// Data point IDs defined by the device protocol.
pub mod dpid {
    pub const SWITCH: u32 = 1;
    pub const WORK_MODE: u32 = 2;
    pub const TEMP: u32 = 3;
    pub const BRIGHT: u32 = 4;
    pub const HUE: u32 = 5;
    pub const SAT: u32 = 6;

    /// Data points a plain light supports.
    pub const LIGHT_DPIDS: &[u32] = &[SWITCH, WORK_MODE, TEMP, BRIGHT, HUE, SAT];
    /// Data points a plain switch supports.
    pub const SWITCH_DPIDS: &[u32] = &[SWITCH];
}

/// Mapping of data point ID to its integer value.
pub type DataPointMap = BTreeMap<u32, i64>;

/// Command codes carried in the `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    /// Identity request (device id, product id, mac, firmware).
    Info = 0,
    /// State request.
    Query = 2,
    /// Control request.
    Set = 3,
    /// Unsolicited state push from the device.
    Report = 10,
}

impl CommandKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CommandKind::Info),
            2 => Some(CommandKind::Query),
            3 => Some(CommandKind::Set),
            10 => Some(CommandKind::Report),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the session may send this command as a request.
    pub fn is_request(self) -> bool {
        !matches!(self, CommandKind::Report)
    }
}

impl TryFrom<u8> for CommandKind {
    type Error = CozyError;

    fn try_from(value: u8) -> Result<Self> {
        Self::from_u8(value).ok_or(CozyError::InvalidCommand(value))
    }
}

/// The JSON object wrapping every protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub pv: u8,
    pub cmd: u8,
    pub sn: String,
    #[serde(default)]
    pub msg: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<i64>,
}

impl Envelope {
    /// Build the request envelope for `cmd`.
    ///
    /// Only INFO, QUERY and SET are valid requests; anything else is a caller bug.
    pub fn request(cmd: CommandKind, sn: String, payload: &DataPointMap) -> Result<Self> {
        let msg = match cmd {
            CommandKind::Info => Value::Object(Map::new()),
            CommandKind::Query => serde_json::json!({ KEY_ATTR: [QUERY_ALL_ATTRS] }),
            CommandKind::Set => {
                let attrs: Vec<u32> = payload.keys().copied().collect();
                serde_json::json!({ KEY_ATTR: attrs, KEY_DATA: payload })
            }
            CommandKind::Report => return Err(CozyError::InvalidCommand(cmd.as_u8())),
        };

        Ok(Self {
            pv: PROTOCOL_VERSION,
            cmd: cmd.as_u8(),
            sn,
            msg,
            res: None,
        })
    }

    /// Parse one frame. Returns `None` for anything that is not an envelope.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Envelope>(frame) {
            Ok(env) => Some(env),
            Err(e) => {
                debug!(
                    "Discarding unparsable frame ({}): {}",
                    e,
                    String::from_utf8_lossy(frame)
                );
                None
            }
        }
    }

    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_u8(self.cmd)
    }

    /// Serialize compactly and append the frame delimiter.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.extend_from_slice(FRAME_DELIMITER);
        Ok(bytes)
    }

    /// The `msg` object, if it is one.
    pub fn msg_object(&self) -> Option<&Map<String, Value>> {
        self.msg.as_object()
    }

    /// Extract `msg.data` as a data point map.
    ///
    /// A missing or non-object `msg`/`data` yields an empty map. Keys that are not
    /// numeric and values that are not integers are skipped.
    pub fn data_points(&self) -> DataPointMap {
        let Some(data) = self
            .msg_object()
            .and_then(|m| m.get(KEY_DATA))
            .and_then(|d| d.as_object())
        else {
            return DataPointMap::new();
        };

        data.iter()
            .filter_map(|(k, v)| {
                let id = k.parse::<u32>().ok()?;
                let value = v
                    .as_i64()
                    .or_else(|| v.as_bool().map(i64::from))
                    .or_else(|| {
                        v.as_f64()
                            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                            .map(|f| f as i64)
                    });
                if value.is_none() {
                    debug!("Skipping non-integer data point {}={}", k, v);
                }
                Some((id, value?))
            })
            .collect()
    }
}

/// Mints sequence tokens and encodes requests for one connection.
///
/// The last minted token is kept as the correlation token the next reply must carry.
#[derive(Debug, Default)]
pub struct Codec {
    last_ms: u64,
    last_sn: Option<String>,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current millisecond timestamp as a decimal string, strictly increasing per codec.
    pub fn mint_sn(&mut self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let ms = if now <= self.last_ms {
            self.last_ms + 1
        } else {
            now
        };
        self.last_ms = ms;
        let sn = ms.to_string();
        self.last_sn = Some(sn.clone());
        sn
    }

    /// Encode a request frame, stamping it with a fresh `sn`.
    pub fn encode(&mut self, cmd: CommandKind, payload: &DataPointMap) -> Result<Vec<u8>> {
        if !cmd.is_request() {
            return Err(CozyError::InvalidCommand(cmd.as_u8()));
        }
        let sn = self.mint_sn();
        let frame = Envelope::request(cmd, sn, payload)?.to_frame()?;
        debug!("Encoded frame: {}", String::from_utf8_lossy(&frame).trim_end());
        Ok(frame)
    }

    /// Token of the most recent request, if any.
    pub fn expected_sn(&self) -> Option<&str> {
        self.last_sn.as_deref()
    }
}

/// Accumulates stream bytes and yields complete delimited frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_FRAME_LEN && !self.buf.contains(&b'\n') {
            debug!(
                "Dropping {} undelimited bytes from receive buffer",
                self.buf.len()
            );
            self.buf.clear();
        }
    }

    /// Pop the next complete frame, without its delimiter. Blank lines are skipped.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            while line
                .last()
                .is_some_and(|&b| matches!(b, b'\n' | b'\r' | b' ' | b'\t'))
            {
                line.pop();
            }
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    /// Discard every complete frame currently buffered; returns how many were dropped.
    pub fn discard_frames(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(frame) = self.next_frame() {
            debug!("Discarding unsolicited frame: {}", String::from_utf8_lossy(&frame));
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Return the envelope in `frame` only if it carries `expected_sn`.
pub fn match_frame(frame: &[u8], expected_sn: &str) -> Option<Envelope> {
    let env = Envelope::parse(frame)?;
    if env.sn == expected_sn {
        Some(env)
    } else {
        debug!(
            "Ignoring frame cmd={} sn={} (expecting sn={})",
            env.cmd, env.sn, expected_sn
        );
        None
    }
}

/// Scan `buffer` for the first complete frame carrying `expected_sn` and return its data.
///
/// Frames with another token are skipped; no match yields an empty map.
pub fn decode(buffer: &[u8], expected_sn: &str) -> DataPointMap {
    let mut frames = FrameBuffer::new();
    frames.extend(buffer);
    while let Some(frame) = frames.next_frame() {
        if let Some(env) = match_frame(&frame, expected_sn) {
            return env.data_points();
        }
    }
    DataPointMap::new()
}
