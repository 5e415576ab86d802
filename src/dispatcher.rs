//! The event dispatcher (§4.5): a single `tokio::select!`-driven reactor
//! task. Per-device USB reads run on their own task and post completions
//! over an mpsc channel, standing in for the "auxiliary loopback
//! signalling channel" of §5.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use mux_protocol::envelope::ResultCode;
use mux_protocol::mux_frame::USB_MTU;

use crate::client::{ClientSession, ClientState, Command, VisibleDevice, CLIENT_SOCKET_BUFFER};
use crate::config::ConfigStore;
use crate::connection::ConnectionAction;
use crate::control::{ControlCommand, ControlQueue};
use crate::device::{Device, DeviceAction, DeviceIdentity};
use crate::preflight::{Preflight, PreflightOutcome};
use crate::transport::{UsbEvent, UsbTransport};
use crate::util::{Clock, Registry};

/// Default listen port for the loopback client protocol, carried over
/// from the original daemon's Windows TCP-loopback variant.
pub const DEFAULT_LISTEN_PORT: u16 = 37015;

const USB_READ_MAX_LEN: usize = USB_MTU;

/// Ambient runtime configuration (§2 "Configuration"): the handful of
/// knobs the embedding binary sets up front, plus the one environment
/// variable (§6) the core consults per-request rather than at startup.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Loopback port the client-facing listener binds (§4.5).
    pub listen_port: u16,
    /// Directory the filesystem-backed config store persists
    /// `SystemConfiguration.plist` and `<UDID>.plist` records under.
    pub config_dir: std::path::PathBuf,
}

impl MuxConfig {
    pub fn new(config_dir: impl Into<std::path::PathBuf>) -> Self {
        Self { listen_port: DEFAULT_LISTEN_PORT, config_dir: config_dir.into() }
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }
}

struct DeviceEntry {
    device: Device,
    usb_handle: crate::transport::UsbHandle,
    port_name: String,
}

enum ToClient {
    Bytes(Vec<u8>),
    Close,
}

/// §3 "Client session": pending-connection bookkeeping kept while a
/// client is in CONNECTING1/CONNECTING2/CONNECTED — which device/port its
/// virtual connection lives on, and the request tag its CONNECT reply
/// must carry once the handshake resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoundConnection {
    device_id: u32,
    source_port: u16,
    connect_tag: u32,
}

struct ClientEntry {
    session: ClientSession,
    tx: mpsc::Sender<ToClient>,
    bound_connection: Option<BoundConnection>,
}

enum ReactorEvent {
    UsbRead { device_handle: u32, bytes: Vec<u8> },
    UsbHotplug(UsbEvent),
    ClientAccepted { stream: TcpStream },
    ClientBytes { client_id: u32, bytes: Vec<u8> },
    ClientClosed { client_id: u32 },
    AckDeadline,
}

/// Owns every device and client session; the only thing that ever
/// mutates protocol state. Wrapped in `Arc` so per-device/per-client
/// tasks can reach it to post events.
pub struct MuxCore<T: UsbTransport, C: ConfigStore, P: Preflight> {
    transport: Arc<T>,
    config_store: Arc<C>,
    preflight: Arc<P>,
    clock: Arc<dyn Clock>,

    devices: Mutex<Registry<DeviceEntry>>,
    clients: Mutex<HashMap<u32, ClientEntry>>,
    next_client_id: std::sync::atomic::AtomicU32,
    control_queue: Mutex<ControlQueue>,
}

impl<T: UsbTransport + 'static, C: ConfigStore + 'static, P: Preflight + 'static> MuxCore<T, C, P> {
    pub fn new(transport: Arc<T>, config_store: Arc<C>, preflight: Arc<P>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config_store,
            preflight,
            clock,
            devices: Mutex::new(Registry::new()),
            clients: Mutex::new(HashMap::new()),
            next_client_id: std::sync::atomic::AtomicU32::new(0),
            control_queue: Mutex::new(ControlQueue::new()),
        })
    }

    /// Runs the reactor until `shutdown` fires. §4.5 steps 1-8 are
    /// folded into the `tokio::select!` arms below plus the post-select
    /// housekeeping (control-queue drain, ACK sweep).
    pub async fn run(self: Arc<Self>, listen_port: u16, shutdown: Arc<tokio::sync::Notify>) -> std::io::Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", listen_port)).await?;
        let (usb_tx, mut usb_rx) = mpsc::channel::<ReactorEvent>(256);
        let mut hotplug_rx = self.transport.subscribe();

        loop {
            let ack_wait = self.next_ack_deadline_ms().await;
            let event = tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => ReactorEvent::ClientAccepted { stream },
                        Err(_) => continue,
                    }
                }
                Some(ev) = usb_rx.recv() => ev,
                Some(hp) = hotplug_rx.recv() => ReactorEvent::UsbHotplug(hp),
                _ = sleep_ms(ack_wait) => ReactorEvent::AckDeadline,
            };

            self.clone().handle_event(event, usb_tx.clone()).await;
            self.drain_control_queue().await;
        }

        Ok(())
    }

    async fn next_ack_deadline_ms(&self) -> u64 {
        const DEFAULT_POLL_MS: u64 = 100_000;
        let now = self.clock.now_ms();
        let mut min_wait = DEFAULT_POLL_MS;
        let mut devices = self.devices.lock().await;
        for (_, entry) in devices.iter_mut() {
            for port in entry.device.connection_ports().collect::<Vec<_>>() {
                if let Some(conn) = entry.device.connection_mut(port) {
                    if let Some(deadline) = conn.ack_deadline_ms() {
                        let wait = deadline.saturating_sub(now);
                        min_wait = min_wait.min(wait);
                    }
                }
            }
        }
        min_wait
    }

    async fn handle_event(self: Arc<Self>, event: ReactorEvent, usb_tx: mpsc::Sender<ReactorEvent>) {
        match event {
            ReactorEvent::ClientAccepted { stream } => self.accept_client(stream).await,
            ReactorEvent::ClientBytes { client_id, bytes } => self.on_client_bytes(client_id, &bytes).await,
            ReactorEvent::ClientClosed { client_id } => self.on_client_closed(client_id).await,
            ReactorEvent::UsbRead { device_handle, bytes } => self.on_usb_read(device_handle, bytes).await,
            ReactorEvent::UsbHotplug(UsbEvent::Arrival { port_name }) => self.on_hotplug_arrival(port_name, usb_tx).await,
            ReactorEvent::UsbHotplug(UsbEvent::Removal { port_name }) => self.on_hotplug_removal(port_name).await,
            ReactorEvent::AckDeadline => self.sweep_ack_deadlines().await,
        }
    }

    /// §4.5 step 4: accept + configure the client socket, spawn its
    /// read-pump task.
    async fn accept_client(self: &Arc<Self>, mut stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let client_id = self.next_client_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        log::debug!("client {client_id} connected");
        let (to_client_tx, mut to_client_rx) = mpsc::channel::<ToClient>(64);

        self.clients.lock().await.insert(
            client_id,
            ClientEntry { session: ClientSession::new(), tx: to_client_tx, bound_connection: None },
        );

        let this = self.clone();
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = stream.into_split();
            let writer = tokio::spawn(async move {
                while let Some(msg) = to_client_rx.recv().await {
                    match msg {
                        ToClient::Bytes(buf) => {
                            if write_half.write_all(&buf).await.is_err() {
                                break;
                            }
                        }
                        ToClient::Close => break,
                    }
                }
            });

            let mut buf = vec![0u8; CLIENT_SOCKET_BUFFER];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => this.on_client_bytes(client_id, &buf[..n]).await,
                }
            }
            this.on_client_closed(client_id).await;
            writer.abort();
        });
    }

    async fn on_client_bytes(self: &Arc<Self>, client_id: u32, bytes: &[u8]) {
        // §5 lock order: device list before client list. Peek the binding
        // under a short-lived clients lock, then release it before ever
        // touching the devices lock, so this path never holds clients while
        // waiting on devices (the reverse of `apply_connection_action`'s
        // `DeliverToClient`, which legitimately holds devices before
        // clients — taking both orders on different paths is a deadlock).
        let bound = {
            let clients = self.clients.lock().await;
            clients.get(&client_id).and_then(|e| {
                (e.session.state == ClientState::Connected).then_some(e.bound_connection).flatten()
            })
        };
        if let Some(BoundConnection { device_id, source_port, .. }) = bound {
            // §4.4: CONNECTED clients bypass command parsing entirely;
            // their bytes feed the owning connection's outbound buffer.
            // Bytes arriving while still CONNECTING1/CONNECTING2 are
            // dropped here rather than fed to the connection or parsed as
            // a command — "the inbound buffer is freed" during CONNECTING1
            // and CONNECTING2 has no command parser either.
            self.feed_connected_client(device_id, source_port, bytes).await;
            return;
        }

        let commands = {
            let mut clients = self.clients.lock().await;
            let Some(entry) = clients.get_mut(&client_id) else { return };
            match entry.session.feed(bytes) {
                Ok(cmds) => cmds,
                Err(_) => {
                    let _ = entry.tx.send(ToClient::Close).await;
                    Vec::new()
                }
            }
        };

        for (tag, cmd) in commands {
            self.handle_command(client_id, tag, cmd).await;
        }
    }

    async fn feed_connected_client(&self, device_id: u32, source_port: u16, bytes: &[u8]) {
        let mut devices = self.devices.lock().await;
        let Some(dev_entry) = devices.get_mut(device_id) else { return };
        if let Some(conn) = dev_entry.device.connection_mut(source_port) {
            conn.outbound.extend(bytes.iter().copied());
            let avail: Vec<u8> = conn.outbound.iter().copied().collect();
            let action = conn.client_readable(&avail);
            if let ConnectionAction::SendTcpFrame { header, payload } = action {
                for _ in 0..payload.len() {
                    conn.outbound.pop_front();
                }
                let frame = dev_entry.device.encode_tcp(header, &payload);
                let _ = self.transport.bulk_write(dev_entry.usb_handle, &frame).await;
            }
        }
    }

    async fn handle_command(self: &Arc<Self>, client_id: u32, tag: u32, cmd: Command) {
        match cmd {
            Command::Listen => self.handle_listen(client_id, tag).await,
            Command::Connect { device_id, port_network_order } => {
                self.handle_connect(client_id, tag, device_id, port_network_order).await
            }
            Command::ListDevices => self.handle_list_devices(client_id, tag).await,
            Command::ReadBuid => self.handle_read_buid(client_id, tag).await,
            Command::ReadPairRecord { record_id } => self.handle_read_pair_record(client_id, tag, record_id).await,
            Command::SavePairRecord { record_id, record_data, bundle_id } => {
                self.handle_save_pair_record(client_id, tag, record_id, record_data, bundle_id).await
            }
            Command::DeletePairRecord { record_id } => self.handle_delete_pair_record(client_id, tag, record_id).await,
            Command::AddDevice { location } => {
                self.queue_control(client_id, ControlCommand::AddDevice { location, reply_tag: tag, client_id }).await
            }
            Command::RemoveDevice { location } => {
                self.queue_control(client_id, ControlCommand::RemoveDevice { location, reply_tag: tag, client_id }).await
            }
            Command::DeviceMonitor { location, auto_monitor } => {
                self.queue_control(client_id, ControlCommand::SetDeviceMonitor { location, auto_monitor, reply_tag: tag, client_id })
                    .await
            }
        }
    }

    async fn handle_listen(&self, client_id: u32, tag: u32) {
        // Lock order per §5: device list before client list.
        let visible = self.visible_devices().await;

        let mut clients = self.clients.lock().await;
        let Some(entry) = clients.get_mut(&client_id) else { return };
        entry.session.state = ClientState::Listen;
        let reply = entry.session.encode_result(tag, ResultCode::Ok);
        let _ = entry.tx.send(ToClient::Bytes(reply)).await;

        for device in visible {
            let msg = entry.session.encode_attach(&device);
            let _ = entry.tx.send(ToClient::Bytes(msg)).await;
        }
    }

    async fn handle_connect(self: &Arc<Self>, client_id: u32, tag: u32, device_id: u32, port: u16) {
        let opened = {
            let mut devices = self.devices.lock().await;
            let Some(dev_entry) = devices.get_mut(device_id) else {
                self.reply_result(client_id, tag, ResultCode::BadDevice).await;
                return;
            };
            let mss = dev_entry.device.mss();
            dev_entry.device.open_connection(port, mss).map(|(source_port, frame)| (source_port, frame, dev_entry.usb_handle))
        };

        match opened {
            Ok((source_port, frame, usb_handle)) => {
                log::debug!("client {client_id}: connecting to device {device_id} sport={source_port} dport={port}");
                let mut clients = self.clients.lock().await;
                if let Some(entry) = clients.get_mut(&client_id) {
                    entry.session.state = ClientState::Connecting1;
                    entry.bound_connection = Some(BoundConnection { device_id, source_port, connect_tag: tag });
                }
                drop(clients);
                let _ = self.transport.bulk_write(usb_handle, &frame).await;
                // reply deferred until the three-way handshake resolves (§4.4);
                // `connect_tag` above is what the eventual RESULT_OK/CONNREFUSED
                // reply in `apply_connection_action` carries.
            }
            Err(_) => {
                self.reply_result(client_id, tag, ResultCode::ConnRefused).await;
            }
        }
    }

    async fn handle_list_devices(&self, client_id: u32, tag: u32) {
        // §6: include non-visible devices too when the requesting client's
        // environment has opted in.
        let include_hidden = std::env::var("MCE_INCLUDE_HIDDEN_DEVICES").map(|v| v == "true").unwrap_or(false);
        let visible = if include_hidden { self.all_devices().await } else { self.visible_devices().await };
        let mut clients = self.clients.lock().await;
        let Some(entry) = clients.get_mut(&client_id) else { return };
        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "ListDevices".into());
        let list: Vec<plist::Value> = visible
            .iter()
            .map(|d| {
                let mut item = plist::Dictionary::new();
                item.insert("DeviceID".into(), (d.device_id as u64).into());
                let mut props = plist::Dictionary::new();
                props.insert("SerialNumber".into(), d.serial.clone().into());
                props.insert("LocationID".into(), (d.location as u64).into());
                props.insert("ProductID".into(), (d.product_id as u64).into());
                item.insert("Properties".into(), plist::Value::Dictionary(props));
                plist::Value::Dictionary(item)
            })
            .collect();
        dict.insert("DeviceList".into(), plist::Value::Array(list));
        let mut body = Vec::new();
        let _ = plist::Value::Dictionary(dict).to_writer_xml(&mut body);
        let reply = encode_plist_reply(&entry.session, tag, body);
        let _ = entry.tx.send(ToClient::Bytes(reply)).await;
    }

    async fn handle_read_buid(&self, client_id: u32, tag: u32) {
        let buid = self.config_store.get_system_buid().await.unwrap_or_default();
        let mut clients = self.clients.lock().await;
        let Some(entry) = clients.get_mut(&client_id) else { return };
        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "Result".into());
        dict.insert("BUID".into(), buid.into());
        let mut body = Vec::new();
        let _ = plist::Value::Dictionary(dict).to_writer_xml(&mut body);
        let reply = encode_plist_reply(&entry.session, tag, body);
        let _ = entry.tx.send(ToClient::Bytes(reply)).await;
    }

    async fn handle_read_pair_record(&self, client_id: u32, tag: u32, record_id: String) {
        let record = self.config_store.get_device_record(&record_id).await;
        let mut clients = self.clients.lock().await;
        let Some(entry) = clients.get_mut(&client_id) else { return };
        match record {
            Ok(data) if record_has_required_keys(&data) => {
                let mut dict = plist::Dictionary::new();
                dict.insert("MessageType".into(), "Result".into());
                dict.insert("PairRecordData".into(), plist::Value::Data(data));
                let mut body = Vec::new();
                let _ = plist::Value::Dictionary(dict).to_writer_xml(&mut body);
                let reply = encode_plist_reply(&entry.session, tag, body);
                let _ = entry.tx.send(ToClient::Bytes(reply)).await;
            }
            _ => {
                let reply = entry.session.encode_result(tag, ResultCode::BadDevice);
                let _ = entry.tx.send(ToClient::Bytes(reply)).await;
            }
        }
    }

    async fn handle_save_pair_record(&self, client_id: u32, tag: u32, record_id: String, data: Vec<u8>, bundle_id: String) {
        if bundle_id == crate::client::PAIR_RECORD_BUNDLE_ID {
            let _ = self.config_store.set_device_record(&record_id, &data).await;
        }
        self.reply_result(client_id, tag, ResultCode::Ok).await;
    }

    async fn handle_delete_pair_record(&self, client_id: u32, tag: u32, record_id: String) {
        let _ = self.config_store.remove_device_record(&record_id).await;
        self.reply_result(client_id, tag, ResultCode::Ok).await;
    }

    async fn queue_control(&self, client_id: u32, cmd: ControlCommand) {
        let _ = client_id;
        self.control_queue.lock().await.push(cmd);
    }

    async fn drain_control_queue(&self) {
        let commands = self.control_queue.lock().await.drain();
        for cmd in commands {
            match cmd {
                ControlCommand::AddDevice { reply_tag, client_id, .. } => {
                    self.reply_result(client_id, reply_tag, ResultCode::Ok).await;
                }
                ControlCommand::RemoveDevice { reply_tag, client_id, .. } => {
                    self.reply_result(client_id, reply_tag, ResultCode::Ok).await;
                }
                ControlCommand::SetDeviceMonitor { reply_tag, client_id, .. } => {
                    self.reply_result(client_id, reply_tag, ResultCode::Ok).await;
                }
            }
        }
    }

    async fn reply_result(&self, client_id: u32, tag: u32, code: ResultCode) {
        let mut clients = self.clients.lock().await;
        if let Some(entry) = clients.get_mut(&client_id) {
            let reply = entry.session.encode_result(tag, code);
            let _ = entry.tx.send(ToClient::Bytes(reply)).await;
        }
    }

    async fn on_client_closed(&self, client_id: u32) {
        let removed = self.clients.lock().await.remove(&client_id);
        if let Some(entry) = removed {
            if let Some(BoundConnection { device_id, source_port, .. }) = entry.bound_connection {
                let mut devices = self.devices.lock().await;
                if let Some(dev_entry) = devices.get_mut(device_id) {
                    if let Some(mut conn) = dev_entry.device.remove_connection(source_port) {
                        if let Some(rst) = conn.teardown(false) {
                            let frame = dev_entry.device.encode_tcp(rst, &[]);
                            let _ = self.transport.bulk_write(dev_entry.usb_handle, &frame).await;
                        }
                    }
                }
            }
        }
    }

    async fn on_usb_read(self: &Arc<Self>, device_handle: u32, bytes: Vec<u8>) {
        log::trace!("device {device_handle}: {} bytes in", bytes.len());
        let now = self.clock.now_ms();
        let actions = {
            let mut devices = self.devices.lock().await;
            let Some(entry) = devices.get_mut(device_handle) else { return };
            entry.device.feed_usb_bytes(&bytes, now)
        };
        for action in actions {
            self.apply_device_action(device_handle, action).await;
        }
    }

    async fn apply_device_action(self: &Arc<Self>, device_handle: u32, action: DeviceAction) {
        match action {
            DeviceAction::SendUsb(frame) => {
                let usb_handle = {
                    let devices = self.devices.lock().await;
                    devices.get(device_handle).map(|e| e.usb_handle)
                };
                if let Some(h) = usb_handle {
                    let _ = self.transport.bulk_write(h, &frame).await;
                }
            }
            DeviceAction::RunPreflight => {
                let this = self.clone();
                tokio::spawn(async move { this.run_preflight(device_handle).await });
            }
            DeviceAction::LogInfo(msg) => log::info!("device {device_handle}: {msg}"),
            DeviceAction::LogError(msg) => log::warn!("device {device_handle}: {msg}"),
            DeviceAction::Destroy => self.destroy_device(device_handle).await,
            DeviceAction::Connection { source_port, action } => {
                self.apply_connection_action(device_handle, source_port, action).await
            }
        }
    }

    async fn apply_connection_action(&self, device_handle: u32, source_port: u16, action: ConnectionAction) {
        match action {
            ConnectionAction::NotifyConnectResult { ok } => {
                let client_id = self.find_client_for(device_handle, source_port).await;
                if let Some(client_id) = client_id {
                    let mut clients = self.clients.lock().await;
                    if let Some(entry) = clients.get_mut(&client_id) {
                        // §3/§8 scenario 3: the reply must carry the tag from
                        // the original CONNECT request, not a synthesized one.
                        let tag = entry.bound_connection.map(|b| b.connect_tag).unwrap_or(0);
                        entry.session.state = if ok { ClientState::Connecting2 } else { ClientState::Command };
                        let reply = entry.session.encode_result(tag, if ok { ResultCode::Ok } else { ResultCode::ConnRefused });
                        let sent = entry.tx.send(ToClient::Bytes(reply)).await;
                        if sent.is_ok() && ok {
                            entry.session.state = ClientState::Connected;
                        } else if !ok {
                            entry.bound_connection = None;
                        }
                    }
                }
            }
            ConnectionAction::DeliverToClient => {
                let client_id = self.find_client_for(device_handle, source_port).await;
                if let Some(client_id) = client_id {
                    let mut devices = self.devices.lock().await;
                    let Some(dev_entry) = devices.get_mut(device_handle) else { return };
                    let Some(conn) = dev_entry.device.connection_mut(source_port) else { return };
                    let drained: Vec<u8> = conn.inbound.iter().copied().collect();
                    drop(devices);

                    // §5 lock order: never hold clients while acquiring devices.
                    // Send with clients held, then release it before the
                    // follow-up devices lock for the window-update rule.
                    let sent_ok = {
                        let clients = self.clients.lock().await;
                        match clients.get(&client_id) {
                            Some(entry) => entry.tx.send(ToClient::Bytes(drained.clone())).await.is_ok(),
                            None => false,
                        }
                    };

                    if sent_ok {
                        let mut devices = self.devices.lock().await;
                        if let Some(dev_entry) = devices.get_mut(device_handle) {
                            if let Some(conn) = dev_entry.device.connection_mut(source_port) {
                                if let Some(ConnectionAction::SendTcpFrame { header, payload }) =
                                    conn.client_drained(drained.len())
                                {
                                    let frame = dev_entry.device.encode_tcp(header, &payload);
                                    let _ = self.transport.bulk_write(dev_entry.usb_handle, &frame).await;
                                }
                            }
                        }
                    }
                }
            }
            ConnectionAction::SendTcpFrame { header, payload } => {
                let mut devices = self.devices.lock().await;
                if let Some(dev_entry) = devices.get_mut(device_handle) {
                    let frame = dev_entry.device.encode_tcp(header, &payload);
                    let _ = self.transport.bulk_write(dev_entry.usb_handle, &frame).await;
                }
            }
            ConnectionAction::TeardownClient => {
                if let Some(client_id) = self.find_client_for(device_handle, source_port).await {
                    self.clients.lock().await.remove(&client_id);
                }
            }
            ConnectionAction::None => {}
        }
    }

    async fn find_client_for(&self, device_handle: u32, source_port: u16) -> Option<u32> {
        let clients = self.clients.lock().await;
        clients
            .iter()
            .find(|(_, e)| matches!(e.bound_connection, Some(b) if b.device_id == device_handle && b.source_port == source_port))
            .map(|(id, _)| *id)
    }

    /// Runs preflight and, if it reports the device visible, broadcasts an
    /// ATTACH to every LISTEN client — not only ones that issue LISTEN
    /// afterwards. §3's invariant ties visibility directly to ATTACH
    /// delivery, and §8 scenario 2 has a client that connected *before*
    /// the device arrived still receive the notification once preflight
    /// finishes.
    async fn run_preflight(&self, device_handle: u32) {
        let udid = {
            let devices = self.devices.lock().await;
            devices.get(device_handle).map(|e| e.port_name.clone())
        };
        let Some(udid) = udid else { return };
        let outcome = self.preflight.run(&udid, device_handle).await;
        let newly_visible = {
            let mut devices = self.devices.lock().await;
            let Some(entry) = devices.get_mut(device_handle) else { return };
            let became_visible = matches!(outcome, PreflightOutcome::Visible) && !entry.device.visible;
            entry.device.visible = matches!(outcome, PreflightOutcome::Visible);
            became_visible.then(|| device_to_visible(device_handle, entry))
        };
        if let Some(device) = newly_visible {
            self.broadcast_attach(&device).await;
        } else if let Some(event_name) = outcome.pairing_event_name() {
            self.broadcast_pairing_event(device_handle, event_name).await;
            if matches!(outcome, PreflightOutcome::RemovedDuringAdd) {
                self.destroy_device(device_handle).await;
            }
        }
    }

    /// Tears a device out of the registry (§3: "DEAD devices drain their
    /// connections then are destroyed", §7: transport failures "tear down
    /// all its connections, emit DETACH events to listeners"): closes every
    /// client bound to one of its connections, then removes it and, if it
    /// was visible, broadcasts DETACH.
    async fn destroy_device(&self, device_handle: u32) {
        self.close_device_clients(device_handle).await;
        let was_visible = {
            let mut devices = self.devices.lock().await;
            let was_visible = devices.get(device_handle).map(|e| e.device.visible).unwrap_or(false);
            devices.remove(device_handle);
            was_visible
        };
        if was_visible {
            self.broadcast_detach(device_handle).await;
        }
    }

    /// Closes every client currently bound to one of `device_handle`'s
    /// virtual connections, without attempting an RST on a device that is
    /// already gone or dying.
    async fn close_device_clients(&self, device_handle: u32) {
        let ports: Vec<u16> = {
            let devices = self.devices.lock().await;
            devices.get(device_handle).map(|e| e.device.connection_ports().collect()).unwrap_or_default()
        };
        for port in ports {
            if let Some(client_id) = self.find_client_for(device_handle, port).await {
                let removed = self.clients.lock().await.remove(&client_id);
                if let Some(entry) = removed {
                    let _ = entry.tx.send(ToClient::Close).await;
                }
            }
        }
    }

    async fn sweep_ack_deadlines(&self) {
        let now = self.clock.now_ms();
        let mut devices = self.devices.lock().await;
        let mut pending = Vec::new();
        for (device_handle, entry) in devices.iter_mut() {
            for port in entry.device.connection_ports().collect::<Vec<_>>() {
                if let Some(conn) = entry.device.connection_mut(port) {
                    if let Some(action) = conn.force_ack_if_overdue(now) {
                        pending.push((device_handle, action));
                    }
                }
            }
        }
        for (device_handle, action) in pending {
            if let ConnectionAction::SendTcpFrame { header, payload } = action {
                if let Some(entry) = devices.get_mut(device_handle) {
                    let frame = entry.device.encode_tcp(header, &payload);
                    let _ = self.transport.bulk_write(entry.usb_handle, &frame).await;
                }
            }
        }
    }

    /// Open Question (§9): the original source suppresses "device already
    /// exists" inconsistently (only once preflight has started). Here the
    /// policy is made uniform: any arrival notification for a `port_name`
    /// that already has a live device entry is treated as a duplicate,
    /// regardless of whether that entry has started or finished preflight,
    /// and is reported to every LISTEN client instead of opening a second
    /// session.
    async fn on_hotplug_arrival(self: &Arc<Self>, port_name: String, usb_tx: mpsc::Sender<ReactorEvent>) {
        let duplicate_of = {
            let devices = self.devices.lock().await;
            devices.iter().find(|(_, e)| e.port_name == port_name).map(|(h, _)| h)
        };
        if let Some(existing) = duplicate_of {
            self.broadcast_pairing_event(existing, "ErrorDeviceAlreadyExists").await;
            return;
        }

        let opened = self.transport.open(&port_name).await;
        let Ok((usb_handle, caps)) = opened else { return };
        let identity = DeviceIdentity {
            serial: caps.serial.unwrap_or_else(|| port_name.clone()),
            location: caps.location,
            product_id: caps.pid as u32,
        };
        let (device, version_frame) = Device::open(0, identity);
        let device_handle = {
            let mut devices = self.devices.lock().await;
            devices.insert(DeviceEntry { device, usb_handle, port_name: port_name.clone() })
        };
        let _ = self.transport.bulk_write(usb_handle, &version_frame).await;

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match this.transport.bulk_read(usb_handle, USB_READ_MAX_LEN).await {
                    Ok(bytes) if !bytes.is_empty() => {
                        if usb_tx.send(ReactorEvent::UsbRead { device_handle, bytes }).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        });
    }

    async fn on_hotplug_removal(&self, port_name: String) {
        let dead = {
            let devices = self.devices.lock().await;
            devices.iter().find(|(_, e)| e.port_name == port_name).map(|(h, _)| h)
        };
        if let Some(handle) = dead {
            self.destroy_device(handle).await;
        }
    }

    async fn visible_devices(&self) -> Vec<VisibleDevice> {
        let devices = self.devices.lock().await;
        devices
            .iter()
            .filter(|(_, e)| e.device.visible)
            .map(|(handle, e)| device_to_visible(handle, e))
            .collect()
    }

    /// §6 "LISTDEVICES": every device regardless of visibility, used only
    /// when `MCE_INCLUDE_HIDDEN_DEVICES=true`.
    async fn all_devices(&self) -> Vec<VisibleDevice> {
        let devices = self.devices.lock().await;
        devices.iter().map(|(handle, e)| device_to_visible(handle, e)).collect()
    }

    /// Sends an ATTACH notification (§4.4) to every client currently in
    /// LISTEN state, in that client's own wire format.
    async fn broadcast_attach(&self, device: &VisibleDevice) {
        let mut clients = self.clients.lock().await;
        for entry in clients.values_mut() {
            if entry.session.state == ClientState::Listen {
                let msg = entry.session.encode_attach(device);
                let _ = entry.tx.send(ToClient::Bytes(msg)).await;
            }
        }
    }

    /// Sends a DETACH notification (§4.4) to every client currently in
    /// LISTEN state, in that client's own wire format.
    async fn broadcast_detach(&self, device_id: u32) {
        let mut clients = self.clients.lock().await;
        for entry in clients.values_mut() {
            if entry.session.state == ClientState::Listen {
                let msg = entry.session.encode_detach(device_id);
                let _ = entry.tx.send(ToClient::Bytes(msg)).await;
            }
        }
    }

    /// Sends a plist-only pairing-stage notification (§4.4) to every
    /// client currently in LISTEN state with the plist wire version.
    async fn broadcast_pairing_event(&self, device_id: u32, event_name: &str) {
        let mut clients = self.clients.lock().await;
        for entry in clients.values_mut() {
            if entry.session.state == ClientState::Listen && entry.session.wire_version() == crate::client::WIRE_VERSION_PLIST {
                let msg = entry.session.encode_pairing_event(device_id, event_name);
                let _ = entry.tx.send(ToClient::Bytes(msg)).await;
            }
        }
    }
}

fn device_to_visible(handle: u32, entry: &DeviceEntry) -> VisibleDevice {
    VisibleDevice {
        device_id: handle,
        serial: entry.device.identity.serial.clone(),
        location: entry.device.identity.location,
        product_id: entry.device.identity.product_id,
    }
}

fn record_has_required_keys(data: &[u8]) -> bool {
    let Ok(value) = plist::Value::from_reader(std::io::Cursor::new(data)) else { return false };
    let Some(dict) = value.as_dictionary() else { return false };
    ["DeviceCertificate", "HostID", "SystemBUID"].iter().all(|k| dict.get(*k).is_some())
}

fn encode_plist_reply(session: &ClientSession, tag: u32, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::new();
    let env = mux_protocol::envelope::Envelope {
        length: (mux_protocol::envelope::ENVELOPE_SIZE + body.len()) as u32,
        version: session.wire_version(),
        message: mux_protocol::envelope::message_type::PLIST,
        tag,
    };
    env.encode(&mut out);
    out.extend_from_slice(&body);
    out
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
}
