//! Router, NI-control, admin, route-string, error and info headers.
//!
//! These are the outer headers the router service classifies a message by.
//! Field names follow the semantic names used in the original SAP NI
//! protocol; only what the router handler needs is modeled.

use crate::Error;

/// NI control opcodes (a small subset -- version negotiation only; every
/// other opcode is rejected by the router as "invalid client version").
pub const NI_VERSION_REQUEST: u8 = 1;
pub const NI_VERSION_RESPONSE: u8 = 2;

/// Admin sub-commands.
pub const ADM_INFO_REQUEST: u8 = 2;
pub const ADM_TRACE_CONNECTION: u8 = 12;

/// Router return codes used in error responses.
pub const RC_TIMEOUT: i32 = -5;
pub const RC_INVALID_VERSION: i32 = -13;
pub const RC_ADMIN_DENIED: i32 = -94;

/// The outermost classification of an inbound message on the router's port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterMessage {
    Control { ni_version: u8 },
    Admin { command: u8, body: Vec<u8> },
    Route(RouteRequest),
    Unknown,
}

/// A single hop in a route string: `(host, port, password?)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHop {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

/// A parsed route request, as carried in the wire "route string".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub hops: Vec<RouteHop>,
    pub route_entries: u32,
    pub route_rest_nodes: u32,
    pub route_offset: u32,
    pub route_length: u32,
    pub route_talk_mode: TalkMode,
    pub route_ni_version: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkMode {
    Ni,
    Raw,
}

/// Tag byte distinguishing the three message kinds this protocol multiplexes
/// on a single port: control (`0x00`), admin (`0x01`), route (`0x02`).
const TAG_CONTROL: u8 = 0x00;
const TAG_ADMIN: u8 = 0x01;
const TAG_ROUTE: u8 = 0x02;

/// Classifies and decodes a raw NI payload (already frame-stripped) into a
/// `RouterMessage`. Returns `RouterMessage::Unknown` rather than an error for
/// tag bytes this router doesn't recognize, matching the spec's "unknown"
/// classification (the router logs it and sends no response).
pub fn decode(payload: &[u8]) -> Result<RouterMessage, Error> {
    if payload.is_empty() {
        return Err(Error::Truncated);
    }

    match payload[0] {
        TAG_CONTROL => {
            if payload.len() < 2 {
                return Err(Error::Truncated);
            }
            Ok(RouterMessage::Control {
                ni_version: payload[1],
            })
        }
        TAG_ADMIN => {
            if payload.len() < 2 {
                return Err(Error::Truncated);
            }
            Ok(RouterMessage::Admin {
                command: payload[1],
                body: payload[2..].to_vec(),
            })
        }
        TAG_ROUTE => decode_route(&payload[1..]).map(RouterMessage::Route),
        _ => Ok(RouterMessage::Unknown),
    }
}

/// Route string layout (after the tag byte):
///
/// ```text
/// u8   route_ni_version
/// u32  route_entries
/// u32  route_rest_nodes
/// u32  route_offset
/// u32  route_length
/// u8   route_talk_mode   (0 = ni, 1 = raw)
/// u32  hop_count
/// hop_count * {
///     u16  host_len
///     host_len bytes  host (utf8)
///     u16  port
///     u16  password_len
///     password_len bytes  password (utf8, empty => None)
/// }
/// ```
fn decode_route(body: &[u8]) -> Result<RouteRequest, Error> {
    let mut cur = Cursor::new(body);

    let route_ni_version = cur.u8()?;
    let route_entries = cur.u32()?;
    let route_rest_nodes = cur.u32()?;
    let route_offset = cur.u32()?;
    let route_length = cur.u32()?;
    let route_talk_mode = match cur.u8()? {
        0 => TalkMode::Ni,
        1 => TalkMode::Raw,
        _ => return Err(Error::InvalidHeader),
    };

    let hop_count = cur.u32()?;
    let mut hops = Vec::with_capacity(hop_count as usize);
    for _ in 0..hop_count {
        let host = cur.string()?;
        let port = cur.u16()?;
        let password = cur.string()?;
        hops.push(RouteHop {
            host,
            port,
            password: if password.is_empty() {
                None
            } else {
                Some(password)
            },
        });
    }

    Ok(RouteRequest {
        hops,
        route_entries,
        route_rest_nodes,
        route_offset,
        route_length,
        route_talk_mode,
        route_ni_version,
    })
}

/// Encodes a route request back to wire form; used only by tests to
/// round-trip `decode_route`.
#[cfg(test)]
fn encode_route(req: &RouteRequest) -> Vec<u8> {
    let mut out = vec![TAG_ROUTE, req.route_ni_version];
    out.extend(req.route_entries.to_be_bytes());
    out.extend(req.route_rest_nodes.to_be_bytes());
    out.extend(req.route_offset.to_be_bytes());
    out.extend(req.route_length.to_be_bytes());
    out.push(match req.route_talk_mode {
        TalkMode::Ni => 0,
        TalkMode::Raw => 1,
    });
    out.extend((req.hops.len() as u32).to_be_bytes());
    for hop in &req.hops {
        out.extend((hop.host.len() as u16).to_be_bytes());
        out.extend(hop.host.as_bytes());
        out.extend(hop.port.to_be_bytes());
        let pw = hop.password.as_deref().unwrap_or("");
        out.extend((pw.len() as u16).to_be_bytes());
        out.extend(pw.as_bytes());
    }
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into()?))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into()?))
    }

    fn string(&mut self) -> Result<String, Error> {
        let len = self.u16()? as usize;
        Ok(std::str::from_utf8(self.take(len)?)?.to_string())
    }
}

/// Builds a generic router error response: tag byte + return code + a
/// human-readable message, mirroring the upstream error packet shape.
pub fn encode_error(return_code: i32, message: &str) -> Vec<u8> {
    let mut out = vec![0xFFu8];
    out.extend(return_code.to_be_bytes());
    out.extend((message.len() as u16).to_be_bytes());
    out.extend(message.as_bytes());
    out
}

/// Builds the NI version-negotiation response: `opcode=2, return_code=-13`.
pub fn encode_version_response(server_ni_version: u8) -> Vec<u8> {
    let mut out = vec![TAG_CONTROL, NI_VERSION_RESPONSE, server_ni_version];
    out.extend(RC_INVALID_VERSION.to_be_bytes());
    out
}

/// Builds the `PONG` reply sent on a successfully accepted route.
pub fn encode_pong() -> Vec<u8> {
    b"PONG".to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_round_trip() {
        let req = RouteRequest {
            hops: vec![
                RouteHop {
                    host: "sap-router".into(),
                    port: 3299,
                    password: None,
                },
                RouteHop {
                    host: "10.0.0.1".into(),
                    port: 3200,
                    password: Some("secret".into()),
                },
            ],
            route_entries: 2,
            route_rest_nodes: 0,
            route_offset: 0,
            route_length: 10,
            route_talk_mode: TalkMode::Ni,
            route_ni_version: 2,
        };

        let bytes = encode_route(&req);
        let decoded = match decode(&bytes).unwrap() {
            RouterMessage::Route(r) => r,
            other => panic!("expected route, got {other:?}"),
        };
        assert_eq!(decoded, req);
    }

    #[test]
    fn control_message_carries_version() {
        let bytes = [TAG_CONTROL, 42];
        assert_eq!(
            decode(&bytes).unwrap(),
            RouterMessage::Control { ni_version: 42 }
        );
    }

    #[test]
    fn unknown_tag_is_unknown_not_error() {
        let bytes = [0x7F, 0x00];
        assert_eq!(decode(&bytes).unwrap(), RouterMessage::Unknown);
    }
}
