//! End-to-end scenarios driven through a real loopback socket against a
//! fake `UsbTransport`, exercising the parts of §8 that do not depend on
//! the 30ms ACK-coalescing timer (that behavior already has focused unit
//! coverage in `connection.rs`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use mux_protocol::envelope::{message_type, Envelope, ENVELOPE_SIZE};
use mux_protocol::mux_frame::{decode_header, encode_header, MuxProtocol, MuxVersion, VersionHeader};
use usbmuxd_core::config::FsConfigStore;
use usbmuxd_core::error::TransportError;
use usbmuxd_core::preflight::AlwaysVisiblePreflight;
use usbmuxd_core::transport::{DeviceCaps, UsbEvent, UsbHandle, UsbTransport};
use usbmuxd_core::util::MonotonicClock;
use usbmuxd_core::MuxCore;

/// A `UsbTransport` with no real hardware behind it. `open` always
/// succeeds and hotplug events are injected by the test through
/// `fire_arrival`. The one thing it does emulate is the device side of
/// the version handshake: a VERSION frame written to it gets echoed back
/// on the next `bulk_read`, exactly like a real device would, so the
/// session reaches ACTIVE and preflight runs without a `tokio::time`
/// dependency.
struct FakeUsbTransport {
    hotplug_rx: StdMutex<Option<mpsc::Receiver<UsbEvent>>>,
    hotplug_tx: mpsc::Sender<UsbEvent>,
    next_handle: AtomicU64,
    device_reply_tx: mpsc::Sender<Vec<u8>>,
    device_reply_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl FakeUsbTransport {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(16);
        let (reply_tx, reply_rx) = mpsc::channel(16);
        Self {
            hotplug_rx: StdMutex::new(Some(rx)),
            hotplug_tx: tx,
            next_handle: AtomicU64::new(1),
            device_reply_tx: reply_tx,
            device_reply_rx: tokio::sync::Mutex::new(reply_rx),
        }
    }

    async fn fire_arrival(&self, port_name: &str) {
        self.hotplug_tx.send(UsbEvent::Arrival { port_name: port_name.to_string() }).await.unwrap();
    }
}

#[async_trait]
impl UsbTransport for FakeUsbTransport {
    async fn open(&self, port_name: &str) -> Result<(UsbHandle, DeviceCaps), TransportError> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let caps = DeviceCaps { vid: 0x05ac, pid: 0x1234, serial: Some(port_name.to_string()), location: 0, turbo_capable: false };
        Ok((handle, caps))
    }

    async fn close(&self, _handle: UsbHandle) {}

    async fn bulk_read(&self, _handle: UsbHandle, _max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.device_reply_rx.lock().await.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn bulk_write(&self, _handle: UsbHandle, buf: &[u8]) -> Result<(), TransportError> {
        if let Ok(header) = decode_header(buf, MuxVersion::V1) {
            if header.protocol == MuxProtocol::Version as u32 {
                let mut reply = Vec::new();
                encode_header(&mut reply, MuxProtocol::Version, 8 + VersionHeader::SIZE as u32, None);
                VersionHeader { major: 1, minor: 0, padding: 0 }.encode(&mut reply);
                let _ = self.device_reply_tx.send(reply).await;
            }
        }
        Ok(())
    }

    async fn get_device_descriptor(&self, _handle: UsbHandle) -> Result<Vec<u8>, TransportError> {
        Ok(Vec::new())
    }

    async fn get_string_descriptor(&self, _handle: UsbHandle, _index: u8) -> Result<String, TransportError> {
        Ok(String::new())
    }

    async fn get_configuration_descriptor(&self, _handle: UsbHandle, _index: u8) -> Result<Vec<u8>, TransportError> {
        Ok(Vec::new())
    }

    async fn select_configuration(&self, _handle: UsbHandle, _value: u8) -> Result<(), TransportError> {
        Ok(())
    }

    fn write_max_packet_size(&self, _handle: UsbHandle) -> u16 {
        512
    }

    fn subscribe(&self) -> mpsc::Receiver<UsbEvent> {
        self.hotplug_rx.lock().unwrap().take().expect("subscribe called more than once")
    }
}

/// Binds an ephemeral port and releases it immediately, for the reactor
/// to rebind a moment later. A tiny race in theory; in practice nothing
/// else on the test host grabs a freshly-closed loopback port in time.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Harness {
    port: u16,
    transport: Arc<FakeUsbTransport>,
    // Kept alive so the backing directory survives for the harness's lifetime.
    _config_dir: tempfile::TempDir,
}

async fn spawn_core() -> Harness {
    let port = free_port().await;
    let transport = Arc::new(FakeUsbTransport::new());
    let config_dir = tempfile::tempdir().unwrap();
    let config_store = Arc::new(FsConfigStore::new(config_dir.path()));
    let preflight = Arc::new(AlwaysVisiblePreflight);
    let clock = Arc::new(MonotonicClock::new());

    let core = MuxCore::new(transport.clone(), config_store, preflight, clock);
    let shutdown = Arc::new(tokio::sync::Notify::new());
    tokio::spawn(async move {
        let _ = core.run(port, shutdown).await;
    });

    // Give the listener a moment to bind before the test dials in.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    Harness { port, transport, _config_dir: config_dir }
}

fn binary_envelope(message: u32, tag: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    Envelope { length: (ENVELOPE_SIZE + body.len()) as u32, version: 0, message, tag }.encode(&mut out);
    out.extend_from_slice(body);
    out
}

async fn read_envelope(stream: &mut TcpStream) -> (Envelope, Vec<u8>) {
    let mut header = [0u8; ENVELOPE_SIZE];
    stream.read_exact(&mut header).await.unwrap();
    let env = Envelope::decode(&header).unwrap();
    let mut body = vec![0u8; env.length as usize - ENVELOPE_SIZE];
    if !body.is_empty() {
        stream.read_exact(&mut body).await.unwrap();
    }
    (env, body)
}

#[tokio::test]
async fn listdevices_is_empty_before_any_device_arrives() {
    let harness = spawn_core().await;
    let mut stream = TcpStream::connect(("127.0.0.1", harness.port)).await.unwrap();

    let mut dict = plist::Dictionary::new();
    dict.insert("MessageType".into(), "ListDevices".into());
    let mut body = Vec::new();
    plist::Value::Dictionary(dict).to_writer_xml(&mut body).unwrap();
    let mut frame = Vec::new();
    Envelope { length: (ENVELOPE_SIZE + body.len()) as u32, version: 1, message: message_type::PLIST, tag: 1 }.encode(&mut frame);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await.unwrap();

    let (env, reply_body) = read_envelope(&mut stream).await;
    assert_eq!(env.message, message_type::PLIST);
    let value = plist::Value::from_reader(std::io::Cursor::new(reply_body)).unwrap();
    let dict = value.as_dictionary().unwrap();
    assert_eq!(dict.get("DeviceList").unwrap().as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn listen_client_receives_attach_for_device_arriving_after_listen() {
    let harness = spawn_core().await;
    let mut stream = TcpStream::connect(("127.0.0.1", harness.port)).await.unwrap();

    stream.write_all(&binary_envelope(message_type::LISTEN, 1, &[])).await.unwrap();
    let (result_env, result_body) = read_envelope(&mut stream).await;
    assert_eq!(result_env.message, message_type::RESULT);
    assert_eq!(u32::from_le_bytes(result_body[..4].try_into().unwrap()), 0);

    harness.transport.fire_arrival("fake-serial-0001").await;

    let (attach_env, attach_body) = read_envelope(&mut stream).await;
    assert_eq!(attach_env.message, message_type::DEVICE_ADD);
    let record = mux_protocol::envelope::AttachRecordV0::decode(&attach_body).unwrap();
    assert_eq!(record.serial, "fake-serial-0001");
}

#[tokio::test]
async fn duplicate_arrival_for_live_port_reports_already_exists() {
    let harness = spawn_core().await;
    let mut stream = TcpStream::connect(("127.0.0.1", harness.port)).await.unwrap();

    let mut listen_dict = plist::Dictionary::new();
    listen_dict.insert("MessageType".into(), "Listen".into());
    let mut body = Vec::new();
    plist::Value::Dictionary(listen_dict).to_writer_xml(&mut body).unwrap();
    let mut frame = Vec::new();
    Envelope { length: (ENVELOPE_SIZE + body.len()) as u32, version: 1, message: message_type::PLIST, tag: 1 }.encode(&mut frame);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await.unwrap();
    let _ = read_envelope(&mut stream).await; // Result reply

    harness.transport.fire_arrival("dup-serial").await;
    let (attach_env, _) = read_envelope(&mut stream).await;
    assert_eq!(attach_env.message, message_type::PLIST);

    harness.transport.fire_arrival("dup-serial").await;
    let (event_env, event_body) = read_envelope(&mut stream).await;
    assert_eq!(event_env.message, message_type::PLIST);
    let value = plist::Value::from_reader(std::io::Cursor::new(event_body)).unwrap();
    let dict = value.as_dictionary().unwrap();
    assert_eq!(dict.get("MessageType").unwrap().as_string(), Some("ErrorDeviceAlreadyExists"));
}
