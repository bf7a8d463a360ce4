//! DHCP wire format: the fixed BOOTP header plus the TLV option list (§4.7,
//! §3).
//!
//! Options are preserved in full on decode, even codes this stack never
//! acts on (option 55's parameter request list, option 61's client id, ...),
//! so a future collaborator parsing DISCOVER/REQUEST can still see them.

use tracing::debug;

use crate::addr::{Ipv4Address, MacAddress};

const MAGIC_COOKIE: u32 = 0x6382_5363;
const HTYPE_ETHERNET: u8 = 1;
const HLEN_ETHERNET: u8 = 6;
const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;
const FIXED_HEADER_LEN: usize = 1 + 1 + 1 + 1 + 4 + 2 + 2 + 4 + 4 + 4 + 4 + 16 + SNAME_LEN + FILE_LEN;
/// RFC 1542 minimum BOOTP message size; real clients pad to this even when
/// the options list is short.
const MIN_MESSAGE_LEN: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpOp {
    BootRequest,
    BootReply,
}

impl DhcpOp {
    fn to_u8(self) -> u8 {
        match self {
            DhcpOp::BootRequest => 1,
            DhcpOp::BootReply => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DhcpOp::BootRequest),
            2 => Some(DhcpOp::BootReply),
            _ => None,
        }
    }
}

/// Option 53's value set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
    Unknown(u8),
}

impl DhcpMessageType {
    fn to_u8(self) -> u8 {
        match self {
            DhcpMessageType::Discover => 1,
            DhcpMessageType::Offer => 2,
            DhcpMessageType::Request => 3,
            DhcpMessageType::Decline => 4,
            DhcpMessageType::Ack => 5,
            DhcpMessageType::Nak => 6,
            DhcpMessageType::Release => 7,
            DhcpMessageType::Inform => 8,
            DhcpMessageType::Unknown(v) => v,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => DhcpMessageType::Discover,
            2 => DhcpMessageType::Offer,
            3 => DhcpMessageType::Request,
            4 => DhcpMessageType::Decline,
            5 => DhcpMessageType::Ack,
            6 => DhcpMessageType::Nak,
            7 => DhcpMessageType::Release,
            8 => DhcpMessageType::Inform,
            other => DhcpMessageType::Unknown(other),
        }
    }
}

/// A single decoded DHCP option. Everything this server itself emits or
/// inspects gets a typed variant; everything else round-trips through
/// `Unknown` so it isn't silently discarded (§4.7 supplement).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    MessageType(DhcpMessageType),
    SubnetMask(Ipv4Address),
    Router(Vec<Ipv4Address>),
    DomainNameServer(Vec<Ipv4Address>),
    HostName(String),
    DomainName(String),
    BroadcastAddress(Ipv4Address),
    RequestedIpAddress(Ipv4Address),
    IpAddressLeaseTime(u32),
    ServerIdentifier(Ipv4Address),
    ParameterRequestList(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    Unknown { code: u8, bytes: Vec<u8> },
}

impl DhcpOption {
    fn code(&self) -> u8 {
        match self {
            DhcpOption::SubnetMask(_) => 1,
            DhcpOption::Router(_) => 3,
            DhcpOption::DomainNameServer(_) => 6,
            DhcpOption::HostName(_) => 12,
            DhcpOption::DomainName(_) => 15,
            DhcpOption::BroadcastAddress(_) => 28,
            DhcpOption::RequestedIpAddress(_) => 50,
            DhcpOption::IpAddressLeaseTime(_) => 51,
            DhcpOption::MessageType(_) => 53,
            DhcpOption::ServerIdentifier(_) => 54,
            DhcpOption::ParameterRequestList(_) => 55,
            DhcpOption::ClientIdentifier(_) => 61,
            DhcpOption::Unknown { code, .. } => *code,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            DhcpOption::SubnetMask(ip) => ip.octets().to_vec(),
            DhcpOption::Router(ips) | DhcpOption::DomainNameServer(ips) => {
                ips.iter().flat_map(|ip| ip.octets()).collect()
            }
            DhcpOption::HostName(s) | DhcpOption::DomainName(s) => s.as_bytes().to_vec(),
            DhcpOption::BroadcastAddress(ip) => ip.octets().to_vec(),
            DhcpOption::RequestedIpAddress(ip) => ip.octets().to_vec(),
            DhcpOption::IpAddressLeaseTime(secs) => secs.to_be_bytes().to_vec(),
            DhcpOption::MessageType(kind) => vec![kind.to_u8()],
            DhcpOption::ServerIdentifier(ip) => ip.octets().to_vec(),
            DhcpOption::ParameterRequestList(codes) => codes.clone(),
            DhcpOption::ClientIdentifier(bytes) => bytes.clone(),
            DhcpOption::Unknown { bytes, .. } => bytes.clone(),
        }
    }

    fn parse(code: u8, data: &[u8]) -> DhcpOption {
        match code {
            1 if data.len() == 4 => DhcpOption::SubnetMask(Ipv4Address::from_bytes(data)),
            3 if !data.is_empty() && data.len() % 4 == 0 => {
                DhcpOption::Router(data.chunks_exact(4).map(Ipv4Address::from_bytes).collect())
            }
            6 if !data.is_empty() && data.len() % 4 == 0 => {
                DhcpOption::DomainNameServer(data.chunks_exact(4).map(Ipv4Address::from_bytes).collect())
            }
            12 => DhcpOption::HostName(String::from_utf8_lossy(data).into_owned()),
            15 => DhcpOption::DomainName(String::from_utf8_lossy(data).into_owned()),
            28 if data.len() == 4 => DhcpOption::BroadcastAddress(Ipv4Address::from_bytes(data)),
            50 if data.len() == 4 => DhcpOption::RequestedIpAddress(Ipv4Address::from_bytes(data)),
            51 if data.len() == 4 => DhcpOption::IpAddressLeaseTime(u32::from_be_bytes(data.try_into().unwrap())),
            53 if data.len() == 1 => DhcpOption::MessageType(DhcpMessageType::from_u8(data[0])),
            54 if data.len() == 4 => DhcpOption::ServerIdentifier(Ipv4Address::from_bytes(data)),
            55 => DhcpOption::ParameterRequestList(data.to_vec()),
            61 => DhcpOption::ClientIdentifier(data.to_vec()),
            _ => DhcpOption::Unknown { code, bytes: data.to_vec() },
        }
    }
}

/// A decoded DHCP message (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: DhcpOp,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub client_ip: Ipv4Address,
    pub your_ip: Ipv4Address,
    pub server_ip: Ipv4Address,
    pub gateway_ip: Ipv4Address,
    pub client_mac: MacAddress,
    pub server_name: String,
    pub boot_file: String,
    pub options: Vec<DhcpOption>,
}

impl DhcpMessage {
    /// The first option 53 value present, if any.
    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(kind) => Some(*kind),
            _ => None,
        })
    }

    /// The client's parameter request list (option 55), if present.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }
}

/// Parse a DHCP message out of a UDP payload. Validates the magic cookie,
/// hardware type 1, and hardware length 6; anything else is logged and
/// dropped (§4.7).
pub fn parse(bytes: &[u8]) -> Option<DhcpMessage> {
    if bytes.len() < FIXED_HEADER_LEN + 4 {
        debug!(len = bytes.len(), "dhcp message shorter than fixed header");
        return None;
    }
    let op = match DhcpOp::from_u8(bytes[0]) {
        Some(op) => op,
        None => {
            debug!(op = bytes[0], "unsupported dhcp op");
            return None;
        }
    };
    let htype = bytes[1];
    let hlen = bytes[2];
    if htype != HTYPE_ETHERNET || hlen != HLEN_ETHERNET {
        debug!(htype, hlen, "unsupported dhcp hardware type/length");
        return None;
    }

    let mut offset = 4;
    let xid = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let secs = u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap());
    offset += 2;
    let flags = u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap());
    offset += 2;
    let client_ip = Ipv4Address::from_bytes(&bytes[offset..offset + 4]);
    offset += 4;
    let your_ip = Ipv4Address::from_bytes(&bytes[offset..offset + 4]);
    offset += 4;
    let server_ip = Ipv4Address::from_bytes(&bytes[offset..offset + 4]);
    offset += 4;
    let gateway_ip = Ipv4Address::from_bytes(&bytes[offset..offset + 4]);
    offset += 4;
    let client_mac = MacAddress::from_bytes(&bytes[offset..offset + 6]);
    offset += 16; // chaddr is a 16-byte field; only the first 6 bytes are a MAC
    let server_name = trim_cstr(&bytes[offset..offset + SNAME_LEN]);
    offset += SNAME_LEN;
    let boot_file = trim_cstr(&bytes[offset..offset + FILE_LEN]);
    offset += FILE_LEN;

    let magic = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
    if magic != MAGIC_COOKIE {
        debug!("dhcp magic cookie mismatch");
        return None;
    }
    offset += 4;

    let mut options = Vec::new();
    while offset < bytes.len() {
        let code = bytes[offset];
        offset += 1;
        if code == 0xFF {
            break;
        }
        if code == 0x00 {
            continue; // pad
        }
        if offset >= bytes.len() {
            break;
        }
        let len = bytes[offset] as usize;
        offset += 1;
        if offset + len > bytes.len() {
            debug!(code, len, "dhcp option runs past end of message");
            break;
        }
        options.push(DhcpOption::parse(code, &bytes[offset..offset + len]));
        offset += len;
    }

    Some(DhcpMessage {
        op,
        xid,
        secs,
        flags,
        client_ip,
        your_ip,
        server_ip,
        gateway_ip,
        client_mac,
        server_name,
        boot_file,
        options,
    })
}

fn trim_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_cstr(out: &mut Vec<u8>, text: &str, field_len: usize) {
    let mut field = vec![0_u8; field_len];
    let bytes = text.as_bytes();
    let copy_len = bytes.len().min(field_len);
    field[..copy_len].copy_from_slice(&bytes[..copy_len]);
    out.extend_from_slice(&field);
}

/// Emit a DHCP message, padding to the RFC 1542 minimum BOOTP size.
pub fn emit(message: &DhcpMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_MESSAGE_LEN);
    out.push(message.op.to_u8());
    out.push(HTYPE_ETHERNET);
    out.push(HLEN_ETHERNET);
    out.push(0); // hops
    out.extend_from_slice(&message.xid.to_be_bytes());
    out.extend_from_slice(&message.secs.to_be_bytes());
    out.extend_from_slice(&message.flags.to_be_bytes());
    out.extend_from_slice(&message.client_ip.octets());
    out.extend_from_slice(&message.your_ip.octets());
    out.extend_from_slice(&message.server_ip.octets());
    out.extend_from_slice(&message.gateway_ip.octets());
    let mut chaddr = [0_u8; 16];
    chaddr[..6].copy_from_slice(&message.client_mac.octets());
    out.extend_from_slice(&chaddr);
    write_cstr(&mut out, &message.server_name, SNAME_LEN);
    write_cstr(&mut out, &message.boot_file, FILE_LEN);
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());

    for option in &message.options {
        let payload = option.payload();
        out.push(option.code());
        out.push(payload.len() as u8);
        out.extend_from_slice(&payload);
    }
    out.push(0xFF);

    if out.len() < MIN_MESSAGE_LEN {
        out.resize(MIN_MESSAGE_LEN, 0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DhcpMessage {
        DhcpMessage {
            op: DhcpOp::BootRequest,
            xid: 0xDEAD_BEEF,
            secs: 0,
            flags: 0,
            client_ip: Ipv4Address::ANY,
            your_ip: Ipv4Address::ANY,
            server_ip: Ipv4Address::ANY,
            gateway_ip: Ipv4Address::ANY,
            client_mac: MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            server_name: String::new(),
            boot_file: String::new(),
            options: vec![
                DhcpOption::MessageType(DhcpMessageType::Discover),
                DhcpOption::ParameterRequestList(vec![1, 3, 6]),
            ],
        }
    }

    #[test]
    fn round_trips_through_emit_and_parse() {
        let message = sample();
        let bytes = emit(&message);
        assert_eq!(parse(&bytes), Some(message));
    }

    #[test]
    fn emitted_message_meets_bootp_minimum_size() {
        let bytes = emit(&sample());
        assert!(bytes.len() >= MIN_MESSAGE_LEN);
    }

    #[test]
    fn rejects_bad_magic_cookie() {
        let mut bytes = emit(&sample());
        let cookie_offset = FIXED_HEADER_LEN;
        bytes[cookie_offset] ^= 0xFF;
        assert_eq!(parse(&bytes), None);
    }

    #[test]
    fn unknown_options_round_trip() {
        let mut message = sample();
        message.options.push(DhcpOption::Unknown { code: 200, bytes: vec![7, 8, 9] });
        let bytes = emit(&message);
        let decoded = parse(&bytes).unwrap();
        assert!(decoded.options.contains(&DhcpOption::Unknown { code: 200, bytes: vec![7, 8, 9] }));
    }
}
