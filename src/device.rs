//! The per-device session (§4.2): version handshake, USB reassembly, and
//! dispatch into the virtual-connection engine for one attached device.

use std::collections::HashMap;

use mux_protocol::mux_frame::{
    control_code, decode_header, tcp_flags, FramingError, MuxHeader, MuxProtocol, MuxSeq, MuxVersion,
    TcpSubHeader, VersionHeader, DEV_MRU, MUX_MAGIC, USB_MRU, USB_MTU,
};

use crate::connection::{find_sport, Connection, ConnectionAction};
use crate::error::ConnectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Init,
    Active,
    Dead,
}

/// Everything the dispatcher needs to act on after feeding the device
/// one slice of USB-read bytes or one client-originated request.
#[derive(Debug)]
pub enum DeviceAction {
    SendUsb(Vec<u8>),
    Connection { source_port: u16, action: ConnectionAction },
    RunPreflight,
    LogInfo(String),
    LogError(String),
    Destroy,
}

/// The identity fields of §3's "Device record" that the mux protocol
/// never interprets but the client protocol (ATTACH notifications,
/// LISTDEVICES) must echo back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: String,
    pub location: u32,
    pub product_id: u32,
}

pub struct Device {
    pub device_id: u32,
    pub state: DeviceState,
    pub visible: bool,
    pub identity: DeviceIdentity,
    mux_version: MuxVersion,
    device_major: u32,

    tx_seq: u16,
    rx_seq: u16,

    reassembly: Vec<u8>,

    connections: HashMap<u16, Connection>,
    next_sport: u16,
}

impl Device {
    /// Opens a session and returns the VERSION frame that must be sent
    /// to the device immediately (§4.2: "On attach the session sends a
    /// VERSION frame with (major=1, minor=0)").
    pub fn open(device_id: u32, identity: DeviceIdentity) -> (Self, Vec<u8>) {
        let dev = Self {
            device_id,
            state: DeviceState::Init,
            visible: false,
            identity,
            mux_version: MuxVersion::V1,
            device_major: 0,
            tx_seq: 0,
            rx_seq: 0,
            reassembly: Vec::new(),
            connections: HashMap::new(),
            next_sport: 1,
        };
        let mut buf = Vec::new();
        mux_protocol::mux_frame::encode_header(
            &mut buf,
            MuxProtocol::Version,
            8 + VersionHeader::SIZE as u32,
            None,
        );
        VersionHeader { major: 1, minor: 0, padding: 0 }.encode(&mut buf);
        (dev, buf)
    }

    fn header_size(&self) -> usize {
        self.mux_version.header_size()
    }

    /// §4.2 "Reassembly": folds one USB bulk read into frame dispatches.
    /// `read_was_full` is true when the read returned exactly `USB_MRU`
    /// bytes (the host cannot distinguish "exactly full" from "more to
    /// come" any other way).
    pub fn feed_usb_bytes(&mut self, bytes: &[u8], now_ms: u64) -> Vec<DeviceAction> {
        let mut actions = Vec::new();
        let read_was_full = bytes.len() == USB_MRU;

        if !self.reassembly.is_empty() {
            self.reassembly.extend_from_slice(bytes);
            if self.reassembly.len() > DEV_MRU {
                actions.push(DeviceAction::LogError("reassembly buffer overflow".into()));
                self.reassembly.clear();
                return actions;
            }
            let complete = match self.peek_advertised_len(&self.reassembly) {
                Some(advertised) => self.reassembly.len() >= advertised,
                None => false,
            } || !read_was_full;
            if !complete {
                return actions;
            }
            let buf = std::mem::take(&mut self.reassembly);
            self.dispatch_all(&buf, now_ms, &mut actions);
            return actions;
        }

        if read_was_full {
            if let Some(advertised) = self.peek_advertised_len(bytes) {
                if advertised > bytes.len() {
                    self.reassembly = bytes.to_vec();
                    return actions;
                }
            }
        }

        self.dispatch_all(bytes, now_ms, &mut actions);
        actions
    }

    fn peek_advertised_len(&self, buf: &[u8]) -> Option<usize> {
        decode_header(buf, self.mux_version).ok().map(|h| h.length as usize)
    }

    /// Dispatches every complete frame present in `buf`, in order.
    fn dispatch_all(&mut self, buf: &[u8], now_ms: u64, actions: &mut Vec<DeviceAction>) {
        let mut offset = 0;
        while offset < buf.len() {
            let slice = &buf[offset..];
            let header = match decode_header(slice, self.mux_version) {
                Ok(h) => h,
                Err(e) => {
                    actions.push(DeviceAction::LogError(format!("bad mux header: {e}")));
                    return;
                }
            };
            let consumed = header.length as usize;
            if consumed > slice.len() {
                // Partial trailing frame inside a buffer we believed complete;
                // stash it for the next read.
                self.reassembly = slice.to_vec();
                return;
            }
            self.dispatch_one(&header, &slice[self.header_size()..consumed], now_ms, actions);
            offset += consumed;
        }
    }

    fn dispatch_one(&mut self, header: &MuxHeader, payload: &[u8], now_ms: u64, actions: &mut Vec<DeviceAction>) {
        let Some(protocol) = MuxProtocol::from_u32(header.protocol) else {
            actions.push(DeviceAction::LogError(format!("unknown mux protocol {}", header.protocol)));
            return;
        };
        match protocol {
            MuxProtocol::Version => self.on_version_reply(payload, actions),
            MuxProtocol::Control => self.on_control(payload, actions),
            MuxProtocol::Setup => {}
            MuxProtocol::Tcp => self.on_tcp(payload, now_ms, actions),
        }
    }

    fn on_version_reply(&mut self, payload: &[u8], actions: &mut Vec<DeviceAction>) {
        if self.state != DeviceState::Init {
            actions.push(DeviceAction::LogInfo("ignoring VERSION reply outside INIT".into()));
            return;
        }
        let Ok(vh) = VersionHeader::decode(payload) else {
            actions.push(DeviceAction::LogError("malformed VERSION reply".into()));
            self.state = DeviceState::Dead;
            actions.push(DeviceAction::Destroy);
            return;
        };
        if vh.major != 1 && vh.major != 2 {
            actions.push(DeviceAction::LogError(format!("unsupported device major version {}", vh.major)));
            self.state = DeviceState::Dead;
            actions.push(DeviceAction::Destroy);
            return;
        }
        self.device_major = vh.major;
        if vh.major >= 2 {
            self.mux_version = MuxVersion::V2;
            self.tx_seq = 0;
            self.rx_seq = 0xFFFF;
            let mut buf = Vec::new();
            mux_protocol::mux_frame::encode_header(
                &mut buf,
                MuxProtocol::Setup,
                16 + 1,
                Some(self.next_seq()),
            );
            buf.push(0x07);
            actions.push(DeviceAction::SendUsb(buf));
        }
        self.state = DeviceState::Active;
        actions.push(DeviceAction::RunPreflight);
    }

    fn on_control(&mut self, payload: &[u8], actions: &mut Vec<DeviceAction>) {
        if payload.is_empty() {
            return;
        }
        match payload[0] {
            control_code::INFO_LOG => {
                actions.push(DeviceAction::LogInfo(String::from_utf8_lossy(&payload[1..]).into_owned()))
            }
            control_code::ERROR_LOG => {
                actions.push(DeviceAction::LogError(String::from_utf8_lossy(&payload[1..]).into_owned()))
            }
            _ => {}
        }
    }

    fn on_tcp(&mut self, payload: &[u8], now_ms: u64, actions: &mut Vec<DeviceAction>) {
        if self.state != DeviceState::Active {
            return;
        }
        let Ok(th) = TcpSubHeader::decode(payload) else {
            actions.push(DeviceAction::LogError("malformed TCP subheader".into()));
            return;
        };
        let body = &payload[TcpSubHeader::SIZE..];
        let source_port = th.dest_port;

        let Some(conn) = self.connections.get_mut(&source_port) else {
            if th.flags & tcp_flags::RST == 0 {
                actions.push(DeviceAction::SendUsb(self.anonymous_rst(&th)));
            }
            return;
        };

        match conn.on_frame(&th, body, now_ms) {
            Ok(frame_actions) => {
                for action in frame_actions {
                    actions.push(DeviceAction::Connection { source_port, action });
                }
            }
            Err(ConnectionError::PeerReset | ConnectionError::InboundOverflow) => {
                let dead = self.state == DeviceState::Dead;
                if let Some(rst) = conn.teardown(dead) {
                    actions.push(DeviceAction::SendUsb(self.encode_tcp(rst, &[])));
                }
                self.connections.remove(&source_port);
                actions.push(DeviceAction::Connection { source_port, action: ConnectionAction::TeardownClient });
            }
            Err(_) => {
                actions.push(DeviceAction::LogError("bad TCP frame ignored".into()));
            }
        }
    }

    fn anonymous_rst(&mut self, incoming: &TcpSubHeader) -> Vec<u8> {
        let rst = TcpSubHeader {
            source_port: incoming.dest_port,
            dest_port: incoming.source_port,
            seq: 0,
            ack: incoming.seq,
            data_offset: 5,
            flags: tcp_flags::RST,
            window: 0,
        };
        self.encode_tcp(rst, &[])
    }

    /// §4.3 "Open": allocates a source port and the SYN frame to send.
    pub fn open_connection(&mut self, dest_port: u16, mss: u16) -> Result<(u16, Vec<u8>), ConnectionError> {
        let existing = &self.connections;
        let sport = find_sport(|p| existing.contains_key(&p), self.next_sport);
        if sport == 0 {
            return Err(ConnectionError::PortsExhausted);
        }
        self.next_sport = if sport == u16::MAX { 1 } else { sport + 1 };

        let (conn, syn) = Connection::open(sport, dest_port, mss);
        let frame = self.encode_tcp(syn, &[]);
        self.connections.insert(sport, conn);
        Ok((sport, frame))
    }

    pub fn connection_mut(&mut self, source_port: u16) -> Option<&mut Connection> {
        self.connections.get_mut(&source_port)
    }

    pub fn remove_connection(&mut self, source_port: u16) -> Option<Connection> {
        self.connections.remove(&source_port)
    }

    pub fn connection_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.connections.keys().copied()
    }

    /// §4.3 "Open": transmit MSS for a new connection on this device,
    /// derived from the USB MTU and this session's current mux/TCP header
    /// sizes (8 or 16 bytes for the mux header, depending on protocol
    /// version, plus the fixed 20-byte TCP-like subheader).
    pub fn mss(&self) -> u16 {
        (USB_MTU - self.header_size() - TcpSubHeader::SIZE) as u16
    }

    /// §4.2 "Outbound mux send": wraps one TCP subheader + payload in a
    /// mux frame, filling sequence counters for version-2 sessions.
    /// Panics if the resulting frame would exceed the USB MTU, since the
    /// connection engine's `mss` already bounds every payload it builds
    /// and a caller that violates this has a bug (§4.2: "sends larger
    /// than USB MTU are rejected").
    pub fn encode_tcp(&mut self, header: TcpSubHeader, payload: &[u8]) -> Vec<u8> {
        let total_len = self.header_size() + TcpSubHeader::SIZE + payload.len();
        assert!(Self::fits_usb_mtu(total_len), "outbound mux frame of {total_len} bytes exceeds USB MTU");
        let mut buf = Vec::with_capacity(total_len);
        let seq = if self.mux_version == MuxVersion::V2 { Some(self.next_seq()) } else { None };
        mux_protocol::mux_frame::encode_header(&mut buf, MuxProtocol::Tcp, total_len as u32, seq);
        header.encode(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    /// Rejects oversized sends per §4.2 ("Sends larger than USB MTU are rejected").
    pub fn fits_usb_mtu(len: usize) -> bool {
        len <= USB_MTU
    }

    fn next_seq(&mut self) -> MuxSeq {
        let seq = MuxSeq { magic: MUX_MAGIC, tx_seq: self.tx_seq, rx_seq: self.rx_seq };
        self.tx_seq = self.tx_seq.wrapping_add(1);
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_emits_version_frame() {
        let (dev, frame) = Device::open(1, DeviceIdentity::default());
        assert_eq!(dev.state, DeviceState::Init);
        let hdr = decode_header(&frame, MuxVersion::V1).unwrap();
        assert_eq!(hdr.protocol, MuxProtocol::Version as u32);
    }

    #[test]
    fn version_reply_v1_activates_without_setup() {
        let (mut dev, _) = Device::open(1, DeviceIdentity::default());
        let mut frame = Vec::new();
        mux_protocol::mux_frame::encode_header(&mut frame, MuxProtocol::Version, 8 + VersionHeader::SIZE as u32, None);
        VersionHeader { major: 1, minor: 0, padding: 0 }.encode(&mut frame);

        let actions = dev.feed_usb_bytes(&frame, 0);
        assert_eq!(dev.state, DeviceState::Active);
        assert!(actions.iter().any(|a| matches!(a, DeviceAction::RunPreflight)));
        assert!(!actions.iter().any(|a| matches!(a, DeviceAction::SendUsb(_))));
    }

    #[test]
    fn version_reply_v2_sends_setup_and_resets_sequence() {
        let (mut dev, _) = Device::open(1, DeviceIdentity::default());
        let mut frame = Vec::new();
        mux_protocol::mux_frame::encode_header(&mut frame, MuxProtocol::Version, 8 + VersionHeader::SIZE as u32, None);
        VersionHeader { major: 2, minor: 0, padding: 0 }.encode(&mut frame);

        let actions = dev.feed_usb_bytes(&frame, 0);
        assert_eq!(dev.mux_version, MuxVersion::V2);
        assert!(actions.iter().any(|a| matches!(a, DeviceAction::SendUsb(_))));
        assert_eq!(dev.tx_seq, 1); // consumed by the SETUP frame
        assert_eq!(dev.rx_seq, 0xFFFF);
    }

    #[test]
    fn unsupported_major_destroys_device() {
        let (mut dev, _) = Device::open(1, DeviceIdentity::default());
        let mut frame = Vec::new();
        mux_protocol::mux_frame::encode_header(&mut frame, MuxProtocol::Version, 8 + VersionHeader::SIZE as u32, None);
        VersionHeader { major: 9, minor: 0, padding: 0 }.encode(&mut frame);

        let actions = dev.feed_usb_bytes(&frame, 0);
        assert_eq!(dev.state, DeviceState::Dead);
        assert!(actions.iter().any(|a| matches!(a, DeviceAction::Destroy)));
    }

    #[test]
    fn tcp_frame_with_no_matching_connection_gets_anonymous_rst() {
        let (mut dev, _) = Device::open(1, DeviceIdentity::default());
        dev.state = DeviceState::Active;

        let th = TcpSubHeader {
            source_port: 99,
            dest_port: 5, // no connection on source_port=5
            seq: 10,
            ack: 0,
            data_offset: 5,
            flags: tcp_flags::ACK,
            window: 0,
        };
        let mut frame = Vec::new();
        mux_protocol::mux_frame::encode_header(&mut frame, MuxProtocol::Tcp, 8 + TcpSubHeader::SIZE as u32, None);
        th.encode(&mut frame);

        let actions = dev.feed_usb_bytes(&frame, 0);
        assert!(matches!(actions.as_slice(), [DeviceAction::SendUsb(_)]));
    }

    #[test]
    fn partial_read_is_buffered_until_complete() {
        let (mut dev, _) = Device::open(1, DeviceIdentity::default());
        dev.state = DeviceState::Active;
        let mut frame = Vec::new();
        mux_protocol::mux_frame::encode_header(&mut frame, MuxProtocol::Version, 8 + VersionHeader::SIZE as u32, None);
        VersionHeader { major: 1, minor: 0, padding: 0 }.encode(&mut frame);

        let (first, second) = frame.split_at(10);
        let actions = dev.feed_usb_bytes(first, 0);
        assert!(actions.is_empty());
        let actions = dev.feed_usb_bytes(second, 1);
        assert!(actions.iter().any(|a| matches!(a, DeviceAction::RunPreflight)));
    }

    #[test]
    fn open_connection_allocates_distinct_ports() {
        let (mut dev, _) = Device::open(1, DeviceIdentity::default());
        let (p1, _) = dev.open_connection(0x0305, 1024).unwrap();
        let (p2, _) = dev.open_connection(0x0306, 1024).unwrap();
        assert_ne!(p1, p2);
    }
}
