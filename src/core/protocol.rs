//! SOCKS5 protocol parsing
//!
//! Implements the wire format of RFC 1928 and the username/password
//! sub-negotiation of RFC 1929:
//! - Method negotiation: VER(5) NMETHODS METHODS...
//! - Password auth: VER(1) ULEN UNAME PLEN PASSWD
//! - Request: VER(5) CMD RSV ATYP DST.ADDR DST.PORT
//! - Reply: VER(5) REP RSV ATYP BND.ADDR BND.PORT

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::lookup_host;

/// Protocol version byte
pub const SOCKS5_VERSION: u8 = 0x05;
/// Username/password sub-negotiation version (RFC 1929)
pub const AUTH_SUBNEGOTIATION_VERSION: u8 = 0x01;

/// Method selection: no authentication required
pub const METHOD_NO_AUTH: u8 = 0x00;
/// Method selection: username/password
pub const METHOD_USER_PASS: u8 = 0x02;
/// Method selection: no acceptable methods
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Sub-negotiation status codes
pub const AUTH_STATUS_SUCCESS: u8 = 0x00;
pub const AUTH_STATUS_FAILURE: u8 = 0x01;

/// Address type constants
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCmd {
    /// TCP connect
    Connect = 1,
    /// TCP bind
    Bind = 2,
    /// UDP associate
    UdpAssociate = 3,
}

impl TryFrom<u8> for SocksCmd {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SocksCmd::Connect),
            2 => Ok(SocksCmd::Bind),
            3 => Ok(SocksCmd::UdpAssociate),
            _ => Err("invalid socks command"),
        }
    }
}

/// Reply codes (REP field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowedByRuleset = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Map an outbound dial error to the closest reply code
    pub fn from_io_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            ErrorKind::TimedOut => ReplyCode::HostUnreachable,
            ErrorKind::NotFound => ReplyCode::HostUnreachable,
            ErrorKind::PermissionDenied => ReplyCode::NotAllowedByRuleset,
            _ => match err.raw_os_error() {
                // ENETUNREACH / EHOSTUNREACH on Linux
                Some(101) => ReplyCode::NetworkUnreachable,
                Some(113) => ReplyCode::HostUnreachable,
                _ => ReplyCode::GeneralFailure,
            },
        }
    }
}

/// Address types supported by SOCKS5
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::IPv4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => Address::IPv4(v4.octets(), addr.port()),
                None => Address::IPv6(ip.octets(), addr.port()),
            },
        }
    }
}

/// Frame decode result
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// Successfully decoded, with the number of bytes consumed
    Ok(T, usize),
    /// Need more data
    NeedMoreData,
    /// Invalid data
    Invalid(&'static str),
}

impl Address {
    /// Decode address (ATYP + address + port) from buffer
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.is_empty() {
            return DecodeResult::NeedMoreData;
        }

        let atyp = buf[0];
        match atyp {
            ATYP_IPV4 => {
                // 1 (type) + 4 (ip) + 2 (port) = 7 bytes
                if buf.len() < 7 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                DecodeResult::Ok(Address::IPv4(ip, port), 7)
            }
            ATYP_IPV6 => {
                // 1 (type) + 16 (ip) + 2 (port) = 19 bytes
                if buf.len() < 19 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                DecodeResult::Ok(Address::IPv6(ip, port), 19)
            }
            ATYP_DOMAIN => {
                // 1 (type) + 1 (len) + len (domain) + 2 (port)
                if buf.len() < 2 {
                    return DecodeResult::NeedMoreData;
                }
                let domain_len = buf[1] as usize;
                if domain_len == 0 {
                    return DecodeResult::Invalid("empty domain");
                }
                let total_len = 1 + 1 + domain_len + 2;
                if buf.len() < total_len {
                    return DecodeResult::NeedMoreData;
                }
                let domain = match std::str::from_utf8(&buf[2..2 + domain_len]) {
                    Ok(s) => s.to_string(),
                    Err(_) => return DecodeResult::Invalid("invalid domain encoding"),
                };
                let port = u16::from_be_bytes([buf[2 + domain_len], buf[3 + domain_len]]);
                DecodeResult::Ok(Address::Domain(domain, port), total_len)
            }
            _ => DecodeResult::Invalid("invalid address type"),
        }
    }

    /// Encode address to buffer
    /// Returns the number of bytes written
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start_len = buf.len();
        match self {
            Address::IPv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::IPv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf.len() - start_len
    }

    /// Unspecified IPv4 address, used as BND.ADDR in failure replies
    pub fn unspecified() -> Self {
        Address::IPv4([0, 0, 0, 0], 0)
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host string (IP or domain)
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::IPv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Resolve to socket address
    pub async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        self.to_socket_addrs().await?.into_iter().next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {}", self.host()),
            )
        })
    }

    /// Resolve to every candidate address, in resolver order
    pub async fn to_socket_addrs(&self) -> std::io::Result<Vec<SocketAddr>> {
        match self {
            Address::IPv4(ip, port) => Ok(vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port)]),
            Address::IPv6(ip, port) => Ok(vec![SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port)]),
            Address::Domain(domain, port) => {
                let addrs: Vec<SocketAddr> = lookup_host((domain.as_str(), *port)).await?.collect();
                if addrs.is_empty() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    ));
                }
                Ok(addrs)
            }
        }
    }
}

/// Client greeting: VER NMETHODS METHODS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    /// Methods offered by the client, in the client's order
    pub methods: Vec<u8>,
}

impl MethodRequest {
    /// Decode greeting from buffer
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.len() < 2 {
            return DecodeResult::NeedMoreData;
        }
        if buf[0] != SOCKS5_VERSION {
            return DecodeResult::Invalid("unsupported socks version");
        }
        let nmethods = buf[1] as usize;
        if nmethods == 0 {
            return DecodeResult::Invalid("no authentication methods offered");
        }
        if buf.len() < 2 + nmethods {
            return DecodeResult::NeedMoreData;
        }
        DecodeResult::Ok(
            MethodRequest {
                methods: buf[2..2 + nmethods].to_vec(),
            },
            2 + nmethods,
        )
    }

    /// Encode greeting (used by clients and tests)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.methods.len());
        buf.push(SOCKS5_VERSION);
        buf.push(self.methods.len() as u8);
        buf.extend_from_slice(&self.methods);
        buf
    }
}

/// Server method selection reply
pub fn encode_method_reply(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

/// Username/password credentials from the RFC 1929 sub-negotiation
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordAuthRequest {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for PasswordAuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAuthRequest")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl PasswordAuthRequest {
    /// Decode sub-negotiation request from buffer
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        if buf.len() < 2 {
            return DecodeResult::NeedMoreData;
        }
        if buf[0] != AUTH_SUBNEGOTIATION_VERSION {
            return DecodeResult::Invalid("unsupported auth sub-negotiation version");
        }
        let ulen = buf[1] as usize;
        if buf.len() < 2 + ulen + 1 {
            return DecodeResult::NeedMoreData;
        }
        let plen = buf[2 + ulen] as usize;
        let total_len = 3 + ulen + plen;
        if buf.len() < total_len {
            return DecodeResult::NeedMoreData;
        }
        let username = match std::str::from_utf8(&buf[2..2 + ulen]) {
            Ok(s) => s.to_string(),
            Err(_) => return DecodeResult::Invalid("invalid username encoding"),
        };
        let password = match std::str::from_utf8(&buf[3 + ulen..total_len]) {
            Ok(s) => s.to_string(),
            Err(_) => return DecodeResult::Invalid("invalid password encoding"),
        };
        DecodeResult::Ok(PasswordAuthRequest { username, password }, total_len)
    }

    /// Encode sub-negotiation request (used by clients and tests)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.username.len() + self.password.len());
        buf.push(AUTH_SUBNEGOTIATION_VERSION);
        buf.push(self.username.len() as u8);
        buf.extend_from_slice(self.username.as_bytes());
        buf.push(self.password.len() as u8);
        buf.extend_from_slice(self.password.as_bytes());
        buf
    }
}

/// Sub-negotiation status reply
pub fn encode_auth_reply(success: bool) -> [u8; 2] {
    let status = if success {
        AUTH_STATUS_SUCCESS
    } else {
        AUTH_STATUS_FAILURE
    };
    [AUTH_SUBNEGOTIATION_VERSION, status]
}

/// Client request: VER CMD RSV ATYP DST.ADDR DST.PORT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    /// Raw command byte; see [`SocksCmd`]
    pub cmd: u8,
    /// Target address
    pub addr: Address,
}

/// Reasons a request frame can fail to decode after the header was read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// Malformed frame
    Malformed(&'static str),
    /// ATYP is not one of IPv4, domain, IPv6
    UnsupportedAddressType,
}

impl SocksRequest {
    /// Minimum request size: 4 (header) + 7 (min addr IPv4) - 1 (atyp counted in header) = 10
    pub const MIN_SIZE: usize = 10;

    /// Decode request from buffer
    pub fn decode(buf: &[u8]) -> Result<DecodeResult<Self>, RequestError> {
        if buf.len() < 4 {
            return Ok(DecodeResult::NeedMoreData);
        }
        if buf[0] != SOCKS5_VERSION {
            return Err(RequestError::Malformed("unsupported socks version"));
        }
        let cmd = buf[1];
        if buf[2] != 0x00 {
            return Err(RequestError::Malformed("reserved byte must be zero"));
        }
        match Address::decode(&buf[3..]) {
            DecodeResult::Ok(addr, consumed) => {
                Ok(DecodeResult::Ok(SocksRequest { cmd, addr }, 3 + consumed))
            }
            DecodeResult::NeedMoreData => Ok(DecodeResult::NeedMoreData),
            DecodeResult::Invalid("invalid address type") => {
                Err(RequestError::UnsupportedAddressType)
            }
            DecodeResult::Invalid(msg) => Err(RequestError::Malformed(msg)),
        }
    }

    /// Encode request (used by clients and tests)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![SOCKS5_VERSION, self.cmd, 0x00];
        self.addr.encode(&mut buf);
        buf
    }
}

/// Encode a server reply
pub fn encode_reply(code: ReplyCode, bind: &Address) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.push(SOCKS5_VERSION);
    buf.push(code as u8);
    buf.push(0x00);
    bind.encode(&mut buf);
    buf
}
