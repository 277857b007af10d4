//! Connection to the device-control server.
//!
//! One `DeviceLink` owns one WebSocket connection: a single dedicated read
//! loop (concurrent reads on a transport are undefined, so the reader is
//! structurally unique), a write half behind a mutex, the correlation table,
//! and the device roster. Inbound messages with a known id resolve their
//! pending request; everything else flows down the unsolicited-event path
//! that keeps the roster current.
//!
//! Connection failure is a reportable condition, not a process error: the
//! caller gets a `LinkError` and decides about retries. Disconnect is
//! two-phase: signal the shutdown flag, shut the socket down to interrupt
//! the blocking receive, then wait a bounded grace period for the reader.

use crate::correlation::{CorrelationTable, WaitError};
use crate::protocol::{self, Message};
use crate::types::{DeviceEvent, DeviceInfo};
use crate::ws::{self, WsFrame};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
    #[error("request cancelled (link going down)")]
    Cancelled,
    #[error("timed out waiting for a reply")]
    ReplyTimeout,
    #[error("unexpected reply type {0}")]
    UnexpectedReply(&'static str),
    #[error("link is closed")]
    Closed,
}

/// Connection tuning. The defaults suit a local control server.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub url: String,
    pub client_name: String,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub reply_timeout: Duration,
    /// Read-loop receive timeout: the liveness/shutdown poll interval.
    pub read_poll: Duration,
    /// How long disconnect waits for the reader before detaching it.
    pub join_grace: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:12345/link".into(),
            client_name: "stroke-sync".into(),
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(3),
            read_poll: Duration::from_millis(500),
            join_grace: Duration::from_secs(2),
        }
    }
}

pub struct DeviceLink {
    config: LinkConfig,
    writer: Arc<Mutex<TcpStream>>,
    table: Arc<CorrelationTable>,
    roster: Arc<Mutex<BTreeMap<u32, DeviceInfo>>>,
    events_rx: Receiver<DeviceEvent>,
    shutdown: Arc<AtomicBool>,
    reader_done: Receiver<()>,
    server_name: OnceLock<String>,
}

impl DeviceLink {
    /// Open the connection, run the protocol handshake, seed the roster.
    /// If the server reports no devices, scanning is kicked off right away.
    pub fn connect(config: LinkConfig) -> Result<Self, LinkError> {
        let connect_err = |reason: String| LinkError::Connect {
            url: config.url.clone(),
            reason,
        };

        let (host, port, path) = ws::parse_ws_url(&config.url).map_err(&connect_err)?;
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("host resolved to no addresses".into()))?;

        let mut stream = TcpStream::connect_timeout(&addr, config.connect_timeout)
            .map_err(|e| connect_err(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        stream.set_read_timeout(Some(config.read_poll))?;
        stream.set_write_timeout(Some(config.send_timeout))?;
        ws::client_handshake(&mut stream, &format!("{}:{}", host, port), &path)
            .map_err(&connect_err)?;
        info!("Connected to {}", config.url);

        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        let table = Arc::new(CorrelationTable::new());
        let roster = Arc::new(Mutex::new(BTreeMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = unbounded();
        let (done_tx, reader_done) = unbounded();

        {
            let writer = writer.clone();
            let table = table.clone();
            let roster = roster.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("device-link-read".into())
                .spawn(move || {
                    read_loop(stream, writer, table, roster, events_tx, shutdown);
                    drop(done_tx); // closing the channel is the join signal
                })
                .map_err(LinkError::Io)?;
        }

        let link = Self {
            config,
            writer,
            table,
            roster,
            events_rx,
            shutdown,
            reader_done,
            server_name: OnceLock::new(),
        };

        // Protocol handshake: identify ourselves, then learn the roster.
        match link.request(Message::RequestServerInfo {
            id: 0,
            client_name: link.config.client_name.clone(),
        })? {
            Message::ServerInfo {
                server_name,
                message_version,
                ..
            } => {
                info!("Server: {} (protocol v{})", server_name, message_version);
                let _ = link.server_name.set(server_name);
            }
            other => return Err(LinkError::UnexpectedReply(other.tag())),
        }

        match link.request(Message::RequestDeviceList { id: 0 })? {
            Message::DeviceList { devices, .. } => {
                let mut roster = link.roster.lock().unwrap();
                for fields in devices {
                    let device: DeviceInfo = fields.into();
                    info!("Device: {}", device);
                    roster.insert(device.index, device);
                }
            }
            other => return Err(LinkError::UnexpectedReply(other.tag())),
        }

        if link.devices().is_empty() {
            info!("No devices connected; starting scan");
            link.start_scanning()?;
        }

        Ok(link)
    }

    /// Send a request and wait for its correlated reply. Generic server
    /// `Error` payloads come back as `LinkError::Server` so call sites only
    /// match the reply type they actually expect.
    pub fn request(&self, msg: Message) -> Result<Message, LinkError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        // Register before transmitting so a fast response finds its waiter.
        let handle = self.table.register();
        let id = handle.id;
        let msg = msg.with_id(id);
        let text = protocol::encode_envelope(std::slice::from_ref(&msg))?;
        {
            let mut writer = self.writer.lock().unwrap();
            if let Err(e) = ws::write_client_text(&mut *writer, &text) {
                drop(writer);
                // A timed-out send abandons the request, no silent retry.
                self.table.cancel(id);
                return Err(LinkError::Io(e));
            }
        }
        match handle.wait(self.config.reply_timeout) {
            Ok(Message::Error {
                error_message,
                error_code,
                ..
            }) => Err(LinkError::Server {
                code: error_code,
                message: error_message,
            }),
            Ok(reply) => Ok(reply),
            Err(WaitError::Cancelled) => Err(LinkError::Cancelled),
            Err(WaitError::TimedOut) => {
                self.table.cancel(id);
                Err(LinkError::ReplyTimeout)
            }
        }
    }

    fn expect_ok(&self, msg: Message) -> Result<(), LinkError> {
        match self.request(msg)? {
            Message::Ok { .. } => Ok(()),
            other => Err(LinkError::UnexpectedReply(other.tag())),
        }
    }

    pub fn start_scanning(&self) -> Result<(), LinkError> {
        self.expect_ok(Message::StartScanning { id: 0 })
    }

    pub fn stop_scanning(&self) -> Result<(), LinkError> {
        self.expect_ok(Message::StopScanning { id: 0 })
    }

    pub fn ping(&self) -> Result<(), LinkError> {
        self.expect_ok(Message::Ping { id: 0 })
    }

    /// Issue one position/speed stroke command.
    pub fn send_stroke(&self, device_index: u32, position: u8, speed: u8) -> Result<(), LinkError> {
        self.expect_ok(Message::StrokeCmd {
            id: 0,
            device_index,
            position,
            speed,
        })
    }

    /// Idle-state notification for a device (pause/stop hook).
    pub fn stop_device(&self, device_index: u32) -> Result<(), LinkError> {
        self.expect_ok(Message::StopDeviceCmd {
            id: 0,
            device_index,
        })
    }

    /// Current roster snapshot, ordered by device index.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.roster.lock().unwrap().values().cloned().collect()
    }

    /// Target-selection policy: first device, or first one accepting the
    /// given command type when a capability is required.
    pub fn first_device(&self, required_message: Option<&str>) -> Option<DeviceInfo> {
        let roster = self.roster.lock().unwrap();
        roster
            .values()
            .find(|d| match required_message {
                Some(m) => d.messages.iter().any(|have| have == m),
                None => true,
            })
            .cloned()
    }

    /// Roster-change notifications. Clonable; safe to poll from any thread.
    pub fn events(&self) -> Receiver<DeviceEvent> {
        self.events_rx.clone()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.get().map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Two-phase shutdown: flag the reader, interrupt its blocking receive
    /// by shutting the socket down, cancel every pending request, then give
    /// the reader a bounded grace period. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Disconnecting from {}", self.config.url);
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.shutdown(Shutdown::Both);
        }
        self.table.cancel_all();
        match self.reader_done.recv_timeout(self.config.join_grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => debug!("Read loop joined"),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Read loop did not exit within {:?}; detaching it",
                    self.config.join_grace
                );
            }
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ─── Read loop ──────────────────────────────────────────────────────────────

fn read_loop(
    mut stream: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    table: Arc<CorrelationTable>,
    roster: Arc<Mutex<BTreeMap<u32, DeviceInfo>>>,
    events_tx: Sender<DeviceEvent>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Read loop started");
    let mut frames: u64 = 0;
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        match ws::read_frame(&mut stream) {
            Ok(None) => continue, // receive timeout: liveness/shutdown poll
            Ok(Some(WsFrame::Text(text))) => {
                frames += 1;
                match protocol::decode_envelope(&text) {
                    Ok(messages) => {
                        for msg in messages {
                            dispatch(msg, &table, &roster, &events_tx);
                        }
                    }
                    // One bad frame never takes the loop down.
                    Err(e) => warn!("Dropping malformed frame: {}", e),
                }
            }
            Ok(Some(WsFrame::Ping(payload))) => {
                let mut writer = writer.lock().unwrap();
                let _ = ws::write_frame(&mut *writer, ws::OP_PONG, &payload, true);
            }
            Ok(Some(WsFrame::Pong(_))) | Ok(Some(WsFrame::Binary(_))) => {}
            Ok(Some(WsFrame::Close)) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                if !shutdown.load(Ordering::Acquire) {
                    warn!("Read loop error: {}", e);
                }
                break;
            }
        }
    }
    // Whatever is still pending will never get a response now.
    table.cancel_all();
    shutdown.store(true, Ordering::Release);
    debug!("Read loop exited after {} frame(s)", frames);
}

/// Route one inbound message: correlated responses to their waiter,
/// everything else (id 0 or unknown id) to the event path.
fn dispatch(
    msg: Message,
    table: &CorrelationTable,
    roster: &Mutex<BTreeMap<u32, DeviceInfo>>,
    events_tx: &Sender<DeviceEvent>,
) {
    let id = msg.id();
    let unclaimed = if id != 0 { table.resolve(id, msg) } else { Some(msg) };
    if let Some(msg) = unclaimed {
        handle_event(msg, roster, events_tx);
    }
}

fn handle_event(
    msg: Message,
    roster: &Mutex<BTreeMap<u32, DeviceInfo>>,
    events_tx: &Sender<DeviceEvent>,
) {
    match msg {
        Message::DeviceAdded {
            device_index,
            device_name,
            device_messages,
            ..
        } => {
            let device = DeviceInfo {
                index: device_index,
                name: device_name,
                messages: device_messages,
            };
            info!("Device added: {}", device);
            roster.lock().unwrap().insert(device_index, device.clone());
            let _ = events_tx.send(DeviceEvent::Added(device));
        }
        Message::DeviceRemoved { device_index, .. } => {
            info!("Device removed: #{}", device_index);
            roster.lock().unwrap().remove(&device_index);
            let _ = events_tx.send(DeviceEvent::Removed(device_index));
        }
        Message::ScanningFinished { .. } => {
            info!("Scanning finished");
            let _ = events_tx.send(DeviceEvent::ScanningFinished);
        }
        other => debug!("Unsolicited {} dropped", other.tag()),
    }
}
