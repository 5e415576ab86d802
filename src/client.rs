//! The client session (§4.4): parses and replies to commands on the
//! local loopback socket, in both the legacy binary wire format and the
//! plist format.

use mux_protocol::envelope::{message_type, AttachRecordV0, ConnectRequestV0, DetachRecordV0, Envelope, ResultCode, ENVELOPE_SIZE};
use mux_protocol::plist_ext::PlistDictExt;
use plist::{Dictionary, Value};

use crate::error::ClientProtocolError;

pub const WIRE_VERSION_BINARY: u32 = 0;
pub const WIRE_VERSION_PLIST: u32 = 1;

pub const CLIENT_SOCKET_BUFFER: usize = 65_536;

/// Bundle id the SAVEPAIRRECORD command must present, per §4.4.
pub const PAIR_RECORD_BUNDLE_ID: &str = "org.libimobiledevice.usbmuxd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Command,
    Listen,
    Connecting1,
    Connecting2,
    Connected,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleDevice {
    pub device_id: u32,
    pub serial: String,
    pub location: u32,
    pub product_id: u32,
}

/// A parsed client command, independent of wire version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Listen,
    Connect { device_id: u32, port_network_order: u16 },
    ListDevices,
    ReadBuid,
    ReadPairRecord { record_id: String },
    SavePairRecord { record_id: String, record_data: Vec<u8>, bundle_id: String },
    DeletePairRecord { record_id: String },
    AddDevice { location: u32 },
    RemoveDevice { location: u32 },
    DeviceMonitor { location: u32, auto_monitor: bool },
}

/// One client connection's protocol state.
pub struct ClientSession {
    pub state: ClientState,
    wire_version: Option<u32>,
    recv_buf: Vec<u8>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self { state: ClientState::Command, wire_version: None, recv_buf: Vec::new() }
    }

    /// Feeds freshly-read bytes from the client socket; returns every
    /// complete `(tag, Command)` now parseable, and remembers the first
    /// frame's `version` field for the session's lifetime (§4.4 "Framing").
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<(u32, Command)>, ClientProtocolError> {
        if self.state == ClientState::Connecting1 {
            // §4.4: "During CONNECTING1 the inbound buffer is freed";
            // bytes arriving here are simply not parsed as commands.
            return Ok(Vec::new());
        }

        self.recv_buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            if self.recv_buf.len() < ENVELOPE_SIZE {
                break;
            }
            let env = Envelope::decode(&self.recv_buf)?;
            if env.length as usize > CLIENT_SOCKET_BUFFER {
                return Err(ClientProtocolError::FrameTooLarge);
            }
            if (self.recv_buf.len() as u32) < env.length {
                break;
            }

            if self.wire_version.is_none() {
                self.wire_version = Some(env.version);
            }

            let body = self.recv_buf[ENVELOPE_SIZE..env.length as usize].to_vec();
            let cmd = self.parse_command(&env, &body)?;
            self.recv_buf.drain(..env.length as usize);
            if let Some(cmd) = cmd {
                out.push((env.tag, cmd));
            }
        }
        Ok(out)
    }

    pub fn wire_version(&self) -> u32 {
        self.wire_version.unwrap_or(WIRE_VERSION_BINARY)
    }

    fn parse_command(&self, env: &Envelope, body: &[u8]) -> Result<Option<Command>, ClientProtocolError> {
        match env.version {
            WIRE_VERSION_BINARY => self.parse_binary_command(env.message, body),
            WIRE_VERSION_PLIST => self.parse_plist_command(body).map(Some),
            other => Err(ClientProtocolError::BadVersion(other)),
        }
    }

    fn parse_binary_command(&self, message: u32, body: &[u8]) -> Result<Option<Command>, ClientProtocolError> {
        match message {
            message_type::LISTEN => Ok(Some(Command::Listen)),
            message_type::CONNECT => {
                let req = ConnectRequestV0::decode(body).map_err(|_| ClientProtocolError::BadCommand)?;
                Ok(Some(Command::Connect { device_id: req.device_id, port_network_order: req.port_host_order() }))
            }
            _ => Err(ClientProtocolError::BadCommand),
        }
    }

    fn parse_plist_command(&self, body: &[u8]) -> Result<Command, ClientProtocolError> {
        let value = Value::from_reader(std::io::Cursor::new(body))?;
        let dict = value.as_dictionary().ok_or(ClientProtocolError::BadCommand)?;
        let msg_type = dict.as_str_field("MessageType").ok_or(ClientProtocolError::BadCommand)?;

        match msg_type {
            "Listen" => Ok(Command::Listen),
            "Connect" => {
                let device_id = dict.as_u64_field("DeviceID").ok_or(ClientProtocolError::BadCommand)? as u32;
                // §4.4 / Design Note "Endianness": plist `PortNumber` holds the
                // port already in network byte order, stored as a plain
                // integer rather than raw bytes, so it must be byte-swapped
                // here to recover the real port value (unlike the version-0
                // binary body, which is read straight off the wire via
                // `from_be_bytes` and needs no further swap).
                let raw = dict.as_u64_field("PortNumber").ok_or(ClientProtocolError::BadCommand)? as u16;
                Ok(Command::Connect { device_id, port_network_order: raw.swap_bytes() })
            }
            "ListDevices" => Ok(Command::ListDevices),
            "ReadBUID" => Ok(Command::ReadBuid),
            "ReadPairRecord" => {
                let id = dict.as_str_field("PairRecordID").ok_or(ClientProtocolError::BadCommand)?;
                Ok(Command::ReadPairRecord { record_id: id.replace('-', "") })
            }
            "SavePairRecord" => {
                let id = dict.as_str_field("PairRecordID").ok_or(ClientProtocolError::BadCommand)?.to_string();
                let data = dict.as_data_field("PairRecordData").ok_or(ClientProtocolError::BadCommand)?.to_vec();
                let bundle_id = dict.as_str_field("BundleID").unwrap_or_default().to_string();
                Ok(Command::SavePairRecord { record_id: id.replace('-', ""), record_data: data, bundle_id })
            }
            "DeletePairRecord" => {
                let id = dict.as_str_field("PairRecordID").ok_or(ClientProtocolError::BadCommand)?;
                Ok(Command::DeletePairRecord { record_id: id.replace('-', "") })
            }
            "AddDevice" => {
                let loc = dict.as_u64_field("DeviceLocation").ok_or(ClientProtocolError::BadCommand)? as u32;
                Ok(Command::AddDevice { location: loc })
            }
            "RemoveDevice" => {
                let loc = dict.as_u64_field("DeviceLocation").ok_or(ClientProtocolError::BadCommand)? as u32;
                Ok(Command::RemoveDevice { location: loc })
            }
            "DeviceMonitor" => {
                let loc = dict.as_u64_field("DeviceLocation").ok_or(ClientProtocolError::BadCommand)? as u32;
                let auto_monitor = dict.as_bool_field("AutoMonitor").unwrap_or(false);
                Ok(Command::DeviceMonitor { location: loc, auto_monitor })
            }
            _ => Err(ClientProtocolError::BadCommand),
        }
    }

    /// Encodes a result reply for `tag`, per §4.4 "Result encoding".
    pub fn encode_result(&self, tag: u32, code: ResultCode) -> Vec<u8> {
        match self.wire_version() {
            WIRE_VERSION_PLIST => {
                let mut dict = Dictionary::new();
                dict.insert("MessageType".into(), "Result".into());
                dict.insert("Number".into(), (code as u32).into());
                self.encode_plist_frame(tag, &dict)
            }
            _ => {
                let mut body = Vec::new();
                body.extend_from_slice(&(code as u32).to_le_bytes());
                self.encode_envelope(tag, message_type::RESULT, &body)
            }
        }
    }

    /// Encodes one ATTACH (device-add) notification, §4.4 "Notifications".
    pub fn encode_attach(&self, device: &VisibleDevice) -> Vec<u8> {
        match self.wire_version() {
            WIRE_VERSION_PLIST => {
                let mut props = Dictionary::new();
                props.insert("SerialNumber".into(), device.serial.clone().into());
                props.insert("LocationID".into(), (device.location as u64).into());
                props.insert("ProductID".into(), (device.product_id as u64).into());
                props.insert("ConnectionType".into(), "USB".into());
                // High-speed USB 2.0 signaling rate, bits/sec; the original
                // daemon reports the negotiated link speed here, but the
                // mux protocol engine under this trait boundary only ever
                // sees high-speed (480 Mb/s) devices in practice.
                props.insert("ConnectionSpeed".into(), 480_000_000u64.into());

                let mut dict = Dictionary::new();
                dict.insert("MessageType".into(), "Attached".into());
                dict.insert("DeviceID".into(), (device.device_id as u64).into());
                dict.insert("Properties".into(), Value::Dictionary(props));
                self.encode_plist_frame(0, &dict)
            }
            _ => {
                let mut body = Vec::new();
                AttachRecordV0 {
                    device_id: device.device_id,
                    serial: device.serial.clone(),
                    location: device.location,
                    product_id: device.product_id,
                }
                .encode(&mut body);
                self.encode_envelope(0, message_type::DEVICE_ADD, &body)
            }
        }
    }

    /// Encodes one DETACH (device-remove) notification.
    pub fn encode_detach(&self, device_id: u32) -> Vec<u8> {
        match self.wire_version() {
            WIRE_VERSION_PLIST => {
                let mut dict = Dictionary::new();
                dict.insert("MessageType".into(), "Detached".into());
                dict.insert("DeviceID".into(), (device_id as u64).into());
                self.encode_plist_frame(0, &dict)
            }
            _ => {
                let mut body = Vec::new();
                DetachRecordV0 { device_id }.encode(&mut body);
                self.encode_envelope(0, message_type::DEVICE_REMOVE, &body)
            }
        }
    }

    /// Plist-only pairing-stage notifications (§4.4): TrustPending,
    /// PasswordProtected, UserDeniedPairing, RemovedDuringAdd,
    /// ErrorDeviceAlreadyExists. Plist clients only; binary clients never
    /// receive these and the caller must check `wire_version()` first.
    pub fn encode_pairing_event(&self, device_id: u32, event_name: &str) -> Vec<u8> {
        let mut dict = Dictionary::new();
        dict.insert("MessageType".into(), event_name.into());
        dict.insert("DeviceID".into(), (device_id as u64).into());
        self.encode_plist_frame(0, &dict)
    }

    fn encode_plist_frame(&self, tag: u32, dict: &Dictionary) -> Vec<u8> {
        let mut body = Vec::new();
        Value::Dictionary(dict.clone()).to_writer_xml(&mut body).expect("plist encoding cannot fail on an in-memory buffer");
        self.encode_envelope(tag, message_type::PLIST, &body)
    }

    fn encode_envelope(&self, tag: u32, message: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let env = Envelope { length: (ENVELOPE_SIZE + body.len()) as u32, version: self.wire_version(), message, tag };
        env.encode(&mut out);
        out.extend_from_slice(body);
        out
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_envelope(message: u32, tag: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        Envelope { length: (ENVELOPE_SIZE + body.len()) as u32, version: WIRE_VERSION_BINARY, message, tag }.encode(&mut out);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn listen_command_parses_from_binary_frame() {
        let mut session = ClientSession::new();
        let frame = binary_envelope(message_type::LISTEN, 1, &[]);
        let cmds = session.feed(&frame).unwrap();
        assert_eq!(cmds, vec![(1, Command::Listen)]);
    }

    #[test]
    fn connect_command_parses_device_id_and_port() {
        let mut session = ClientSession::new();
        let mut body = Vec::new();
        ConnectRequestV0 { device_id: 7, port_network_order: 0x0305 }.encode(&mut body);
        let frame = binary_envelope(message_type::CONNECT, 2, &body);
        let cmds = session.feed(&frame).unwrap();
        assert_eq!(cmds, vec![(2, Command::Connect { device_id: 7, port_network_order: 0x0305 })]);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut session = ClientSession::new();
        let frame = binary_envelope(message_type::LISTEN, 1, &[]);
        let (first, second) = frame.split_at(8);
        assert!(session.feed(first).unwrap().is_empty());
        let cmds = session.feed(second).unwrap();
        assert_eq!(cmds, vec![(1, Command::Listen)]);
    }

    #[test]
    fn plist_listdevices_round_trips() {
        let mut session = ClientSession::new();
        let mut dict = Dictionary::new();
        dict.insert("MessageType".into(), "ListDevices".into());
        let mut body = Vec::new();
        Value::Dictionary(dict).to_writer_xml(&mut body).unwrap();
        let mut frame = Vec::new();
        Envelope { length: (ENVELOPE_SIZE + body.len()) as u32, version: WIRE_VERSION_PLIST, message: message_type::PLIST, tag: 5 }
            .encode(&mut frame);
        frame.extend_from_slice(&body);

        let cmds = session.feed(&frame).unwrap();
        assert_eq!(cmds, vec![(5, Command::ListDevices)]);
        assert_eq!(session.wire_version(), WIRE_VERSION_PLIST);
    }

    #[test]
    fn pair_record_id_strips_dashes() {
        let mut session = ClientSession::new();
        let mut dict = Dictionary::new();
        dict.insert("MessageType".into(), "ReadPairRecord".into());
        dict.insert("PairRecordID".into(), "AB-CD-EF".into());
        let mut body = Vec::new();
        Value::Dictionary(dict).to_writer_xml(&mut body).unwrap();
        let mut frame = Vec::new();
        Envelope { length: (ENVELOPE_SIZE + body.len()) as u32, version: WIRE_VERSION_PLIST, message: message_type::PLIST, tag: 0 }
            .encode(&mut frame);
        frame.extend_from_slice(&body);

        let cmds = session.feed(&frame).unwrap();
        assert_eq!(cmds, vec![(0, Command::ReadPairRecord { record_id: "ABCDEF".into() })]);
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let mut session = ClientSession::new();
        let mut frame = Vec::new();
        Envelope {
            length: (CLIENT_SOCKET_BUFFER + ENVELOPE_SIZE + 1) as u32,
            version: WIRE_VERSION_BINARY,
            message: message_type::LISTEN,
            tag: 0,
        }
        .encode(&mut frame);
        let err = session.feed(&frame).unwrap_err();
        assert!(matches!(err, ClientProtocolError::FrameTooLarge));
    }

    #[test]
    fn result_encoding_differs_by_wire_version() {
        let mut binary = ClientSession::new();
        binary.feed(&binary_envelope(message_type::LISTEN, 0, &[])).unwrap();
        let reply = binary.encode_result(3, ResultCode::Ok);
        let env = Envelope::decode(&reply).unwrap();
        assert_eq!(env.message, message_type::RESULT);
        assert_eq!(u32::from_le_bytes(reply[16..20].try_into().unwrap()), ResultCode::Ok as u32);
    }
}
