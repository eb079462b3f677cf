//! PROXY protocol headers (HAProxy v1 text and v2 binary).

use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, SocketAddr};

use crate::protocol::ProxyProto;

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
const V2_CMD_LOCAL: u8 = 0x20;
const V2_CMD_PROXY: u8 = 0x21;
const V2_TCP4: u8 = 0x11;
const V2_TCP6: u8 = 0x21;
const V2_UNSPEC: u8 = 0x00;

/// Header describing a connection from `source` to `destination`, or
/// `None` when no header was requested.
pub fn header(version: ProxyProto, source: SocketAddr, destination: SocketAddr) -> Option<Vec<u8>> {
    match version {
        ProxyProto::None => None,
        ProxyProto::V1 => Some(v1(source, destination).into_bytes()),
        ProxyProto::V2 => Some(v2(source, destination)),
    }
}

fn v1(source: SocketAddr, destination: SocketAddr) -> String {
    let family = match (source.ip(), destination.ip()) {
        (IpAddr::V4(_), IpAddr::V4(_)) => "TCP4",
        (IpAddr::V6(_), IpAddr::V6(_)) => "TCP6",
        _ => return "PROXY UNKNOWN\r\n".to_string(),
    };

    format!(
        "PROXY {} {} {} {} {}\r\n",
        family,
        source.ip(),
        destination.ip(),
        source.port(),
        destination.port()
    )
}

fn v2(source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16 + 36);
    buf.put_slice(&V2_SIGNATURE);

    match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            buf.put_u8(V2_CMD_PROXY);
            buf.put_u8(V2_TCP4);
            buf.put_u16(12);
            buf.put_slice(&src.octets());
            buf.put_slice(&dst.octets());
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            buf.put_u8(V2_CMD_PROXY);
            buf.put_u8(V2_TCP6);
            buf.put_u16(36);
            buf.put_slice(&src.octets());
            buf.put_slice(&dst.octets());
        }
        _ => {
            // Mixed families cannot be expressed; receivers use the real peer.
            buf.put_u8(V2_CMD_LOCAL);
            buf.put_u8(V2_UNSPEC);
            buf.put_u16(0);
            return buf.to_vec();
        }
    }

    buf.put_u16(source.port());
    buf.put_u16(destination.port());
    buf.to_vec()
}
