//! Wire-format round-trip vectors, drawn from the concrete end-to-end
//! scenarios a host and device would actually exchange.

use mux_protocol::envelope::{message_type, ConnectRequestV0, Envelope, WIRE_VERSION_BINARY};
use mux_protocol::mux_frame::{
    decode_header, encode_header, tcp_flags, MuxProtocol, MuxSeq, MuxVersion, TcpSubHeader,
    VersionHeader, MUX_MAGIC,
};

#[test]
fn version_attach_frame_v1_session() {
    // Host sends VERSION major=1 minor=0 over a v1 (8-byte header) session.
    let vh = VersionHeader { major: 1, minor: 0, padding: 0 };
    let mut frame = Vec::new();
    let total_len = 8 + VersionHeader::SIZE as u32;
    encode_header(&mut frame, MuxProtocol::Version, total_len, None);
    vh.encode(&mut frame);

    assert_eq!(frame.len(), total_len as usize);
    let hdr = decode_header(&frame, MuxVersion::V1).unwrap();
    assert_eq!(hdr.protocol, MuxProtocol::Version as u32);
    let decoded_vh = VersionHeader::decode(&frame[8..]).unwrap();
    assert_eq!(decoded_vh, vh);
}

#[test]
fn setup_frame_is_single_byte_payload_on_v2_session() {
    let seq = MuxSeq { magic: MUX_MAGIC, tx_seq: 0, rx_seq: 0xFFFF };
    let mut frame = Vec::new();
    let total_len = 16 + 1u32;
    encode_header(&mut frame, MuxProtocol::Setup, total_len, Some(seq));
    frame.push(0x07);

    let hdr = decode_header(&frame, MuxVersion::V2).unwrap();
    assert_eq!(hdr.length as usize, frame.len());
    assert_eq!(frame[16], 0x07);
}

#[test]
fn three_way_handshake_syn_frame_matches_scenario() {
    // Scenario 3: CONNECT to device_id=1 port=0x0305 (decimal 1283, net order).
    let th = TcpSubHeader {
        source_port: 1, // first allocated source port
        dest_port: 0x0305,
        seq: 0,
        ack: 0,
        data_offset: 5,
        flags: tcp_flags::SYN,
        window: TcpSubHeader::encode_window(262144),
    };
    let mut buf = Vec::new();
    let total_len = 8 + TcpSubHeader::SIZE as u32;
    encode_header(&mut buf, MuxProtocol::Tcp, total_len, None);
    th.encode(&mut buf);

    let decoded = TcpSubHeader::decode(&buf[8..]).unwrap();
    assert_eq!(decoded.flags, tcp_flags::SYN);
    assert_eq!(decoded.seq, 0);
}

#[test]
fn syn_ack_reply_window_is_shifted() {
    // Device replies SYN|ACK seq=0 ack=1 window=2 (512 bytes).
    let mut buf = Vec::new();
    let th = TcpSubHeader {
        source_port: 0x0305,
        dest_port: 1,
        seq: 0,
        ack: 1,
        data_offset: 5,
        flags: tcp_flags::SYN | tcp_flags::ACK,
        window: 2,
    };
    th.encode(&mut buf);
    let decoded = TcpSubHeader::decode(&buf).unwrap();
    assert_eq!(decoded.window_bytes(), 512);
}

#[test]
fn client_envelope_is_little_endian_on_the_wire() {
    let env = Envelope { length: 16, version: WIRE_VERSION_BINARY, message: message_type::LISTEN, tag: 0 };
    let mut buf = Vec::new();
    env.encode(&mut buf);
    // length=16 little-endian is bytes [16, 0, 0, 0].
    assert_eq!(&buf[0..4], &[16, 0, 0, 0]);
    assert_eq!(Envelope::decode(&buf).unwrap(), env);
}

#[test]
fn connect_request_v0_preserves_network_order_port() {
    // PortNumber 0x0503 host order -> 0x0305 on the wire (network order),
    // matching the scenario's decimal 1283.
    let req = ConnectRequestV0 { device_id: 1, port_network_order: 0x0305 };
    let mut buf = Vec::new();
    req.encode(&mut buf);
    assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 0x0305);
    assert_eq!(ConnectRequestV0::decode(&buf).unwrap().port_host_order(), 0x0305);
}
