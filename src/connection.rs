//! The virtual-connection engine (§4.3): a user-space TCP-alike running
//! over mux TCP frames. This module is pure state machine — it never
//! touches a socket or the USB transport directly. The dispatcher feeds
//! it inbound frames and client I/O readiness, and acts on the
//! [`ConnectionAction`]s it returns.

use std::collections::VecDeque;

use mux_protocol::mux_frame::{tcp_flags, TcpSubHeader};

use crate::error::ConnectionError;

/// §4.3 "Open": initial inbound-buffer capacity, which doubles as the
/// initial advertised window.
pub const INBOUND_CAPACITY: usize = 262_144;
pub const OUTBOUND_CAPACITY: usize = 65_536;
/// §4.3 flow control: an ACK is forced immediately (rather than
/// coalesced) once the advertised window had fallen below this many
/// bytes and then grew again.
pub const STALL_WATERMARK: usize = 49_152; // USB MTU, §4.2
pub const ACK_TIMEOUT_MS: u64 = 30;
const MAX_SPORT: u16 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Refused,
    Dying,
    Dead,
}

/// Actions the engine wants performed, handed back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    SendTcpFrame { header: TcpSubHeader, payload: Vec<u8> },
    NotifyConnectResult { ok: bool },
    DeliverToClient,
    TeardownClient,
    None,
}

/// One virtual connection, keyed by (source_port, dest_port) on its
/// owning device.
#[derive(Debug)]
pub struct Connection {
    pub source_port: u16,
    pub dest_port: u16,
    pub state: ConnectionState,

    pub tx_seq: u32,
    pub tx_ack: u32,
    pub tx_acked: u32,
    pub tx_win: u32,

    pub rx_seq: u32,
    pub rx_ack: u32,
    pub rx_win: u32,

    pub mss: u16,

    pub inbound: VecDeque<u8>,
    pub outbound: VecDeque<u8>,

    pending_ack_since_ms: Option<u64>,
    window_was_stalled: bool,
}

impl Connection {
    /// §4.3 "Open": allocates fresh connection state and the SYN frame
    /// the caller must send.
    pub fn open(source_port: u16, dest_port: u16, mss: u16) -> (Self, TcpSubHeader) {
        let conn = Self {
            source_port,
            dest_port,
            state: ConnectionState::Connecting,
            tx_seq: 0,
            tx_ack: 0,
            tx_acked: 0,
            tx_win: INBOUND_CAPACITY as u32,
            rx_seq: 0,
            rx_ack: 0,
            rx_win: 0,
            mss,
            inbound: VecDeque::with_capacity(INBOUND_CAPACITY.min(4096)),
            outbound: VecDeque::with_capacity(OUTBOUND_CAPACITY.min(4096)),
            pending_ack_since_ms: None,
            window_was_stalled: false,
        };
        let syn = TcpSubHeader {
            source_port,
            dest_port,
            seq: conn.tx_seq,
            ack: conn.tx_ack,
            data_offset: 5,
            flags: tcp_flags::SYN,
            window: TcpSubHeader::encode_window(conn.tx_win),
        };
        (conn, syn)
    }

    pub fn is_ack_pending(&self) -> bool {
        self.tx_ack != self.tx_acked
    }

    /// Deadline (ms, on the engine's clock) at which a pending ACK must
    /// be force-flushed, per §4.3/§4.5.
    pub fn ack_deadline_ms(&self) -> Option<u64> {
        self.pending_ack_since_ms.map(|since| since + ACK_TIMEOUT_MS)
    }

    /// §4.3 "Readiness": recomputed after every mutation.
    pub fn sendable(&self) -> usize {
        let in_flight = self.tx_seq.wrapping_sub(self.rx_ack) as usize;
        let window_room = (self.rx_win as usize).saturating_sub(in_flight);
        window_room.min(self.outbound.len()).min(self.mss as usize)
    }

    pub fn wants_client_readable(&self) -> bool {
        self.sendable() > 0
    }

    pub fn wants_client_writable(&self) -> bool {
        !self.inbound.is_empty()
    }

    /// Dispatches one inbound TCP frame, per the CONNECTING/CONNECTED
    /// transition rules in §4.3. A frame can demand more than one action
    /// (e.g. the SYN|ACK reply both transmits an ACK frame *and* notifies
    /// the owning client of success), so every action the frame produces
    /// is returned, in the order §4.3 describes performing them.
    pub fn on_frame(&mut self, header: &TcpSubHeader, payload: &[u8], now_ms: u64) -> Result<Vec<ConnectionAction>, ConnectionError> {
        match self.state {
            ConnectionState::Connecting => self.on_frame_connecting(header, now_ms),
            ConnectionState::Connected => self.on_frame_connected(header, payload, now_ms),
            ConnectionState::Refused | ConnectionState::Dying | ConnectionState::Dead => Ok(Vec::new()),
        }
    }

    fn on_frame_connecting(&mut self, header: &TcpSubHeader, now_ms: u64) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if header.flags == (tcp_flags::SYN | tcp_flags::ACK) {
            self.rx_seq = header.seq;
            self.rx_ack = header.ack;
            self.rx_win = header.window_bytes();
            self.tx_seq = self.tx_seq.wrapping_add(1);
            self.tx_ack = self.tx_ack.wrapping_add(1);
            self.state = ConnectionState::Connected;
            self.mark_ack_pending(now_ms);
            let ack_frame = self.build_frame(tcp_flags::ACK, &[]);
            // §4.3: "Transmit an ACK-only frame. Notify the owning client
            // with RESULT_OK".
            return Ok(vec![
                ConnectionAction::SendTcpFrame { header: ack_frame, payload: Vec::new() },
                ConnectionAction::NotifyConnectResult { ok: true },
            ]);
        }

        self.state = if header.flags & tcp_flags::RST != 0 {
            ConnectionState::Refused
        } else {
            ConnectionState::Dying
        };
        Ok(vec![ConnectionAction::NotifyConnectResult { ok: false }])
    }

    fn on_frame_connected(&mut self, header: &TcpSubHeader, payload: &[u8], now_ms: u64) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if header.flags & tcp_flags::RST != 0 {
            self.state = ConnectionState::Dying;
            return Err(ConnectionError::PeerReset);
        }
        if header.flags != tcp_flags::ACK {
            return Err(ConnectionError::BadHandshake);
        }

        if !payload.is_empty() {
            if payload.len() > self.available_inbound() {
                self.state = ConnectionState::Dying;
                return Err(ConnectionError::InboundOverflow);
            }
            self.inbound.extend(payload.iter().copied());
            self.tx_win = self.tx_win.saturating_sub(payload.len() as u32);
            self.tx_ack = self.tx_ack.wrapping_add(payload.len() as u32);
            self.mark_ack_pending(now_ms);
        }

        self.rx_win = header.window_bytes();
        Ok(vec![ConnectionAction::DeliverToClient])
    }

    fn available_inbound(&self) -> usize {
        INBOUND_CAPACITY.saturating_sub(self.inbound.len())
    }

    fn mark_ack_pending(&mut self, now_ms: u64) {
        if self.pending_ack_since_ms.is_none() {
            self.pending_ack_since_ms = Some(now_ms);
        }
    }

    /// Builds a frame for the current tx_seq/tx_ack and marks the ACK as
    /// flushed ("piggybacked" per §4.3).
    fn build_frame(&mut self, flags: u8, _payload: &[u8]) -> TcpSubHeader {
        let header = TcpSubHeader {
            source_port: self.source_port,
            dest_port: self.dest_port,
            seq: self.tx_seq,
            ack: self.tx_ack,
            data_offset: 5,
            flags,
            window: TcpSubHeader::encode_window(self.tx_win),
        };
        self.tx_acked = self.tx_ack;
        self.pending_ack_since_ms = None;
        header
    }

    /// §4.5 step 8: force a pending ACK whose deadline has elapsed.
    pub fn force_ack_if_overdue(&mut self, now_ms: u64) -> Option<ConnectionAction> {
        let deadline = self.ack_deadline_ms()?;
        if now_ms < deadline {
            return None;
        }
        let header = self.build_frame(tcp_flags::ACK, &[]);
        Some(ConnectionAction::SendTcpFrame { header, payload: Vec::new() })
    }

    /// Client became readable; read up to `sendable()` bytes from `read_fn`
    /// and, on success, build the data frame to transmit.
    pub fn client_readable(&mut self, data: &[u8]) -> ConnectionAction {
        if data.is_empty() {
            return ConnectionAction::None;
        }
        let n = data.len().min(self.sendable());
        let header = self.build_frame(tcp_flags::ACK, &data[..n]);
        self.tx_seq = self.tx_seq.wrapping_add(n as u32);
        ConnectionAction::SendTcpFrame { header, payload: data[..n].to_vec() }
    }

    /// Client became writable; caller has drained `drained` bytes from
    /// `self.inbound` and asks the engine to apply the window-update rule.
    pub fn client_drained(&mut self, drained: usize) -> Option<ConnectionAction> {
        if drained == 0 {
            return None;
        }
        for _ in 0..drained {
            self.inbound.pop_front();
        }
        let was_stalled = self.window_was_stalled;
        self.tx_win += drained as u32;
        self.window_was_stalled = (self.tx_win as usize) < STALL_WATERMARK;

        if was_stalled {
            let header = self.build_frame(tcp_flags::ACK, &[]);
            return Some(ConnectionAction::SendTcpFrame { header, payload: Vec::new() });
        }
        None
    }

    /// §4.3 "Teardown". Returns the RST frame to send, unless the device
    /// is dead or the connection already refused/dying.
    pub fn teardown(&mut self, device_is_dead: bool) -> Option<TcpSubHeader> {
        let already_terminal = matches!(self.state, ConnectionState::Dying | ConnectionState::Refused);
        self.state = ConnectionState::Dead;
        if device_is_dead || already_terminal {
            return None;
        }
        Some(TcpSubHeader {
            source_port: self.source_port,
            dest_port: self.dest_port,
            seq: self.tx_seq,
            ack: self.tx_ack,
            data_offset: 5,
            flags: tcp_flags::RST,
            window: 0,
        })
    }
}

/// §4.3 "Port allocation": scans `in_use` for the first free port
/// starting at `start`, wrapping around, per `find_sport`.
pub fn find_sport(in_use: impl Fn(u16) -> bool, start: u16) -> u16 {
    let mut candidate = if start == 0 { 1 } else { start };
    for _ in 0..MAX_SPORT {
        if !in_use(candidate) {
            return candidate;
        }
        candidate = if candidate == MAX_SPORT { 1 } else { candidate + 1 };
    }
    0
}
