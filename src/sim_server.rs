//! In-process simulator of the device-control server.
//!
//! Development and test mode: speaks the real wire protocol over real
//! loopback sockets, so the whole pipeline (link, correlation, scheduler,
//! driver) runs exactly as it would against actual hardware. Received
//! stroke commands are timestamped and forwarded on a channel for
//! assertions; scripted devices can be preloaded or "discovered" when the
//! client asks for a scan.

use crate::protocol::{self, DeviceFields, Message};
use crate::types::DeviceInfo;
use crate::ws::{self, WsFrame};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A device the simulator exposes.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub info: DeviceInfo,
    /// When true the device only appears after a `StartScanning` request.
    pub on_scan: bool,
}

impl SimDevice {
    /// A generic stroker accepting `StrokeCmd`, visible immediately.
    pub fn stroker(index: u32, name: &str) -> Self {
        Self {
            info: DeviceInfo {
                index,
                name: name.into(),
                messages: vec!["StrokeCmd".into(), "StopDeviceCmd".into()],
            },
            on_scan: false,
        }
    }

    pub fn discovered(mut self) -> Self {
        self.on_scan = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SimServerConfig {
    pub server_name: String,
    pub devices: Vec<SimDevice>,
    /// Simulated radio latency between `StartScanning` and the results.
    pub scan_delay: Duration,
}

impl Default for SimServerConfig {
    fn default() -> Self {
        Self {
            server_name: "Sim Device Server".into(),
            devices: vec![SimDevice::stroker(0, "Sim Stroker")],
            scan_delay: Duration::from_millis(30),
        }
    }
}

/// A command the simulator received, timestamped for pacing assertions.
#[derive(Debug, Clone)]
pub enum SimCommand {
    Stroke {
        device_index: u32,
        position: u8,
        speed: u8,
        at: Instant,
    },
    StopDevice {
        device_index: u32,
        at: Instant,
    },
}

/// Handle to a running simulator. The accept loop runs detached for the
/// life of the process, like any of the long-lived component threads.
pub struct SimServer {
    addr: SocketAddr,
    commands_rx: Receiver<SimCommand>,
}

impl SimServer {
    /// Bind a loopback port and start accepting connections.
    pub fn spawn(config: SimServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let (commands_tx, commands_rx) = unbounded();
        let config = Arc::new(config);

        thread::Builder::new()
            .name("sim-accept".into())
            .spawn(move || {
                info!("Simulator server listening on {}", addr);
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let config = config.clone();
                            let commands_tx = commands_tx.clone();
                            thread::Builder::new()
                                .name("sim-conn".into())
                                .spawn(move || serve_connection(stream, config, commands_tx))
                                .unwrap();
                        }
                        Err(e) => warn!("Simulator accept error: {}", e),
                    }
                }
            })?;

        Ok(Self { addr, commands_rx })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}/link", self.addr)
    }

    /// Stream of commands the simulator has accepted.
    pub fn commands(&self) -> Receiver<SimCommand> {
        self.commands_rx.clone()
    }
}

// ─── Connection handling ────────────────────────────────────────────────────

struct Connection {
    /// Devices currently visible to this client.
    visible: Vec<DeviceInfo>,
    /// Devices a scan will surface.
    hidden: Vec<DeviceInfo>,
    scan_delay: Duration,
    server_name: String,
    commands_tx: Sender<SimCommand>,
}

fn serve_connection(mut stream: TcpStream, config: Arc<SimServerConfig>, tx: Sender<SimCommand>) {
    if let Err(e) = ws::server_handshake(&mut stream) {
        warn!("Simulator handshake failed: {}", e);
        return;
    }
    info!("Simulator client connected");

    let mut conn = Connection {
        visible: config
            .devices
            .iter()
            .filter(|d| !d.on_scan)
            .map(|d| d.info.clone())
            .collect(),
        hidden: config
            .devices
            .iter()
            .filter(|d| d.on_scan)
            .map(|d| d.info.clone())
            .collect(),
        scan_delay: config.scan_delay,
        server_name: config.server_name.clone(),
        commands_tx: tx,
    };

    loop {
        match ws::read_frame(&mut stream) {
            Ok(None) => continue,
            Ok(Some(WsFrame::Text(text))) => {
                let messages = match protocol::decode_envelope(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Simulator dropping malformed envelope: {}", e);
                        continue;
                    }
                };
                let mut replies = Vec::new();
                let mut scan_requested = false;
                for msg in messages {
                    if matches!(msg, Message::StartScanning { .. }) {
                        scan_requested = true;
                    }
                    replies.push(conn.answer(msg));
                }
                if send_envelope(&mut stream, &replies).is_err() {
                    break;
                }
                if scan_requested {
                    // Radio latency, then the discoveries arrive unsolicited.
                    thread::sleep(conn.scan_delay);
                    let mut events = Vec::new();
                    for device in conn.hidden.drain(..) {
                        events.push(Message::DeviceAdded {
                            id: 0,
                            device_index: device.index,
                            device_name: device.name.clone(),
                            device_messages: device.messages.clone(),
                        });
                        conn.visible.push(device);
                    }
                    events.push(Message::ScanningFinished { id: 0 });
                    if send_envelope(&mut stream, &events).is_err() {
                        break;
                    }
                }
            }
            Ok(Some(WsFrame::Ping(payload))) => {
                if ws::write_frame(&mut stream, ws::OP_PONG, &payload, false).is_err() {
                    break;
                }
            }
            Ok(Some(WsFrame::Pong(_))) | Ok(Some(WsFrame::Binary(_))) => {}
            Ok(Some(WsFrame::Close)) => break,
            Err(e) => {
                debug!("Simulator connection ended: {}", e);
                break;
            }
        }
    }
    info!("Simulator client disconnected");
}

fn send_envelope(stream: &mut TcpStream, messages: &[Message]) -> io::Result<()> {
    let text = protocol::encode_envelope(messages)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    ws::write_server_text(stream, &text)
}

impl Connection {
    fn answer(&mut self, msg: Message) -> Message {
        let id = msg.id();
        match msg {
            Message::RequestServerInfo { client_name, .. } => {
                info!("Simulator client identifies as {:?}", client_name);
                Message::ServerInfo {
                    id,
                    server_name: self.server_name.clone(),
                    message_version: 1,
                    max_ping_time: 0,
                }
            }
            Message::RequestDeviceList { .. } => Message::DeviceList {
                id,
                devices: self
                    .visible
                    .iter()
                    .map(|d| DeviceFields {
                        device_index: d.index,
                        device_name: d.name.clone(),
                        device_messages: d.messages.clone(),
                    })
                    .collect(),
            },
            Message::StartScanning { .. } | Message::StopScanning { .. } | Message::Ping { .. } => {
                Message::Ok { id }
            }
            Message::StrokeCmd {
                device_index,
                position,
                speed,
                ..
            } => {
                if self.visible.iter().any(|d| d.index == device_index) {
                    let _ = self.commands_tx.send(SimCommand::Stroke {
                        device_index,
                        position,
                        speed,
                        at: Instant::now(),
                    });
                    Message::Ok { id }
                } else {
                    Message::Error {
                        id,
                        error_message: format!("no device at index {}", device_index),
                        error_code: 2,
                    }
                }
            }
            Message::StopDeviceCmd { device_index, .. } => {
                if self.visible.iter().any(|d| d.index == device_index) {
                    let _ = self.commands_tx.send(SimCommand::StopDevice {
                        device_index,
                        at: Instant::now(),
                    });
                    Message::Ok { id }
                } else {
                    Message::Error {
                        id,
                        error_message: format!("no device at index {}", device_index),
                        error_code: 2,
                    }
                }
            }
            other => Message::Error {
                id,
                error_message: format!("unexpected client message {}", other.tag()),
                error_code: 1,
            },
        }
    }
}
