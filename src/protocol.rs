//! Wire protocol for the device-control server.
//!
//! Each WebSocket text frame carries a JSON array of single-key objects,
//! where the key names the message type and the value holds the fields:
//!
//! ```json
//! [{"RequestServerInfo":{"Id":1,"ClientName":"stroke-sync"}}]
//! ```
//!
//! Every message carries a numeric `Id`. 0 means unsolicited / no reply
//! expected; nonzero ids pair requests with responses via the correlation
//! table. The message set is a closed sum type; decoding dispatches on the
//! tag at this one boundary, and unknown tags are logged and dropped without
//! tearing anything down.

use crate::types::DeviceInfo;
use log::warn;
use serde::{Deserialize, Serialize};

// ─── Message set ────────────────────────────────────────────────────────────

/// Device descriptor as it appears inside `DeviceList` / `DeviceAdded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceFields {
    pub device_index: u32,
    pub device_name: String,
    #[serde(default)]
    pub device_messages: Vec<String>,
}

impl From<DeviceFields> for DeviceInfo {
    fn from(d: DeviceFields) -> Self {
        DeviceInfo {
            index: d.device_index,
            name: d.device_name,
            messages: d.device_messages,
        }
    }
}

/// The complete message vocabulary, client and server side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // ── client → server ──
    #[serde(rename_all = "PascalCase")]
    RequestServerInfo { id: u32, client_name: String },
    #[serde(rename_all = "PascalCase")]
    RequestDeviceList { id: u32 },
    #[serde(rename_all = "PascalCase")]
    StartScanning { id: u32 },
    #[serde(rename_all = "PascalCase")]
    StopScanning { id: u32 },
    #[serde(rename_all = "PascalCase")]
    Ping { id: u32 },
    /// Position/speed stroke command for a single linear-motion device.
    #[serde(rename_all = "PascalCase")]
    StrokeCmd {
        id: u32,
        device_index: u32,
        position: u8,
        speed: u8,
    },
    /// Idle-state notification: halt whatever the device is doing.
    #[serde(rename_all = "PascalCase")]
    StopDeviceCmd { id: u32, device_index: u32 },

    // ── server → client ──
    #[serde(rename_all = "PascalCase")]
    Ok { id: u32 },
    #[serde(rename_all = "PascalCase")]
    Error {
        id: u32,
        error_message: String,
        error_code: i32,
    },
    #[serde(rename_all = "PascalCase")]
    ServerInfo {
        id: u32,
        server_name: String,
        message_version: u32,
        max_ping_time: u32,
    },
    #[serde(rename_all = "PascalCase")]
    DeviceList { id: u32, devices: Vec<DeviceFields> },

    // ── server → client, unsolicited (Id = 0) ──
    #[serde(rename_all = "PascalCase")]
    DeviceAdded {
        id: u32,
        device_index: u32,
        device_name: String,
        #[serde(default)]
        device_messages: Vec<String>,
    },
    #[serde(rename_all = "PascalCase")]
    DeviceRemoved { id: u32, device_index: u32 },
    #[serde(rename_all = "PascalCase")]
    ScanningFinished { id: u32 },
}

impl Message {
    /// Correlation id carried by any message.
    pub fn id(&self) -> u32 {
        match self {
            Message::RequestServerInfo { id, .. }
            | Message::RequestDeviceList { id }
            | Message::StartScanning { id }
            | Message::StopScanning { id }
            | Message::Ping { id }
            | Message::StrokeCmd { id, .. }
            | Message::StopDeviceCmd { id, .. }
            | Message::Ok { id }
            | Message::Error { id, .. }
            | Message::ServerInfo { id, .. }
            | Message::DeviceList { id, .. }
            | Message::DeviceAdded { id, .. }
            | Message::DeviceRemoved { id, .. }
            | Message::ScanningFinished { id } => *id,
        }
    }

    /// Same message with the correlation id replaced. Used at send time,
    /// after the correlation table has allocated a fresh id.
    pub fn with_id(mut self, new_id: u32) -> Self {
        match &mut self {
            Message::RequestServerInfo { id, .. }
            | Message::RequestDeviceList { id }
            | Message::StartScanning { id }
            | Message::StopScanning { id }
            | Message::Ping { id }
            | Message::StrokeCmd { id, .. }
            | Message::StopDeviceCmd { id, .. }
            | Message::Ok { id }
            | Message::Error { id, .. }
            | Message::ServerInfo { id, .. }
            | Message::DeviceList { id, .. }
            | Message::DeviceAdded { id, .. }
            | Message::DeviceRemoved { id, .. }
            | Message::ScanningFinished { id } => *id = new_id,
        }
        self
    }

    /// Tag name as it appears on the wire (for logging).
    pub fn tag(&self) -> &'static str {
        match self {
            Message::RequestServerInfo { .. } => "RequestServerInfo",
            Message::RequestDeviceList { .. } => "RequestDeviceList",
            Message::StartScanning { .. } => "StartScanning",
            Message::StopScanning { .. } => "StopScanning",
            Message::Ping { .. } => "Ping",
            Message::StrokeCmd { .. } => "StrokeCmd",
            Message::StopDeviceCmd { .. } => "StopDeviceCmd",
            Message::Ok { .. } => "Ok",
            Message::Error { .. } => "Error",
            Message::ServerInfo { .. } => "ServerInfo",
            Message::DeviceList { .. } => "DeviceList",
            Message::DeviceAdded { .. } => "DeviceAdded",
            Message::DeviceRemoved { .. } => "DeviceRemoved",
            Message::ScanningFinished { .. } => "ScanningFinished",
        }
    }
}

// ─── Envelope codec ─────────────────────────────────────────────────────────

/// Serialize messages into the tagged-envelope-array wire form.
pub fn encode_envelope(messages: &[Message]) -> Result<String, serde_json::Error> {
    serde_json::to_string(messages)
}

/// Parse a wire frame into messages.
///
/// The outer array must parse; individual entries that fail (unknown tag,
/// missing field) are logged and dropped so one bad message cannot take the
/// read loop down with it.
pub fn decode_envelope(text: &str) -> Result<Vec<Message>, serde_json::Error> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(text)?;
    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<Message>(entry.clone()) {
            Ok(msg) => messages.push(msg),
            Err(e) => {
                let tag = entry
                    .as_object()
                    .and_then(|o| o.keys().next().cloned())
                    .unwrap_or_else(|| "<not an object>".into());
                warn!("Dropping undecodable message \"{}\": {}", tag, e);
            }
        }
    }
    Ok(messages)
}
