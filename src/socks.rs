//! SOCKS5 protocol support (RFC 1928).
//!
//! Three consumers share this module: the client's local proxy listener
//! (server side of SOCKS5), the per-stream target framing that crosses the
//! tunnel, and the server's optional upstream SOCKS5 dialer (client side
//! of SOCKS5, with RFC 1929 username/password support).

use std::io::{Error, ErrorKind};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS5_VERSION: u8 = 0x05;

/// Authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Address type codes.
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// A connect target: hostname or IP literal, plus port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.parse::<std::net::Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Serve the SOCKS5 greeting + request on an accepted connection and
/// return the requested command and target.
///
/// Only `NoAuth` is offered to local applications; the proxy listens on
/// loopback.
pub async fn socks5_handshake<S>(stream: &mut S) -> Result<(Command, TargetAddr), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    if buf[0] != SOCKS5_VERSION {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("unsupported SOCKS version: {}", buf[0]),
        ));
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&(AuthMethod::NoAuth as u8)) {
        stream
            .write_all(&[SOCKS5_VERSION, AuthMethod::NoAcceptable as u8])
            .await?;
        return Err(Error::new(
            ErrorKind::PermissionDenied,
            "no supported authentication method",
        ));
    }
    stream
        .write_all(&[SOCKS5_VERSION, AuthMethod::NoAuth as u8])
        .await?;

    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS5_VERSION {
        return Err(Error::new(ErrorKind::InvalidData, "invalid SOCKS version"));
    }

    let command = match request[1] {
        0x01 => Command::Connect,
        0x02 => Command::Bind,
        0x03 => Command::UdpAssociate,
        other => {
            send_reply(stream, ReplyCode::CommandNotSupported, None).await?;
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("unsupported command {other}"),
            ));
        }
    };

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| Error::new(ErrorKind::InvalidData, "invalid domain name"))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        _ => {
            send_reply(stream, ReplyCode::AddressTypeNotSupported, None).await?;
            return Err(Error::new(ErrorKind::Unsupported, "unsupported address type"));
        }
    };

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let port = u16::from_be_bytes(port_bytes);

    log::debug!("SOCKS5 {command:?} request for {host}:{port}");
    Ok((command, TargetAddr { host, port }))
}

/// Send a SOCKS5 reply. `None` bind address encodes as 0.0.0.0:0, which
/// is all the tunnel ever reports.
pub async fn send_reply<S>(
    stream: &mut S,
    reply: ReplyCode,
    bind_addr: Option<&TargetAddr>,
) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let mut response = vec![SOCKS5_VERSION, reply as u8, 0x00];
    match bind_addr.and_then(|a| a.host.parse::<IpAddr>().ok()) {
        Some(IpAddr::V4(ip)) => {
            response.push(ATYP_IPV4);
            response.extend_from_slice(&ip.octets());
        }
        Some(IpAddr::V6(ip)) => {
            response.push(ATYP_IPV6);
            response.extend_from_slice(&ip.octets());
        }
        None => {
            response.push(ATYP_IPV4);
            response.extend_from_slice(&[0, 0, 0, 0]);
        }
    }
    let port = bind_addr.map(|a| a.port).unwrap_or(0);
    response.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&response).await
}

/// Write the per-stream target header: `[type][addr][port BE]`, the same
/// address grammar SOCKS5 uses, minus the protocol chatter around it.
pub async fn write_target_address<W>(w: &mut W, target: &TargetAddr) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(target.host.len() + 4);
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if target.host.len() > 255 {
                return Err(Error::new(ErrorKind::InvalidInput, "domain name too long"));
            }
            buf.push(ATYP_DOMAIN);
            buf.push(target.host.len() as u8);
            buf.extend_from_slice(target.host.as_bytes());
        }
    }
    buf.extend_from_slice(&target.port.to_be_bytes());
    w.write_all(&buf).await
}

/// Counterpart of [`write_target_address`].
pub async fn read_target_address<R>(r: &mut R) -> Result<TargetAddr, Error>
where
    R: AsyncRead + Unpin,
{
    let mut atyp = [0u8; 1];
    r.read_exact(&mut atyp).await?;

    let host = match atyp[0] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            r.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            r.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            r.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| Error::new(ErrorKind::InvalidData, "invalid domain name"))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            r.read_exact(&mut addr).await?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        other => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("unknown address type {other}"),
            ))
        }
    };

    let mut port = [0u8; 2];
    r.read_exact(&mut port).await?;
    Ok(TargetAddr {
        host,
        port: u16::from_be_bytes(port),
    })
}

/// Client-side SOCKS5 dialer for forwarding through an upstream proxy.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    pub proxy_addr: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Socks5Dialer {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            username: None,
            password: None,
        }
    }

    /// Connect to `target` through the proxy.
    pub async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, Error> {
        let mut stream = TcpStream::connect(&self.proxy_addr).await?;
        self.handshake(&mut stream).await?;
        self.connect(&mut stream, target).await?;
        Ok(stream)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<(), Error> {
        let methods: &[u8] = if self.username.is_some() {
            &[AuthMethod::NoAuth as u8, AuthMethod::UsernamePassword as u8]
        } else {
            &[AuthMethod::NoAuth as u8]
        };
        let mut greeting = vec![SOCKS5_VERSION, methods.len() as u8];
        greeting.extend_from_slice(methods);
        stream.write_all(&greeting).await?;

        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await?;
        if resp[0] != SOCKS5_VERSION {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("proxy spoke version {}", resp[0]),
            ));
        }
        match resp[1] {
            m if m == AuthMethod::NoAuth as u8 => Ok(()),
            m if m == AuthMethod::UsernamePassword as u8 => {
                self.authenticate(stream).await
            }
            m if m == AuthMethod::NoAcceptable as u8 => Err(Error::new(
                ErrorKind::PermissionDenied,
                "proxy accepts none of our authentication methods",
            )),
            other => Err(Error::new(
                ErrorKind::InvalidData,
                format!("proxy chose unexpected auth method {other}"),
            )),
        }
    }

    /// RFC 1929 username/password subnegotiation.
    async fn authenticate(&self, stream: &mut TcpStream) -> Result<(), Error> {
        let username = self.username.as_deref().ok_or_else(|| {
            Error::new(ErrorKind::PermissionDenied, "proxy requires credentials")
        })?;
        let password = self.password.as_deref().unwrap_or("");

        let mut req = vec![0x01, username.len() as u8];
        req.extend_from_slice(username.as_bytes());
        req.push(password.len() as u8);
        req.extend_from_slice(password.as_bytes());
        stream.write_all(&req).await?;

        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await?;
        if resp[1] != 0x00 {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "proxy rejected credentials",
            ));
        }
        Ok(())
    }

    async fn connect(&self, stream: &mut TcpStream, target: &TargetAddr) -> Result<(), Error> {
        let mut req = vec![SOCKS5_VERSION, Command::Connect as u8, 0x00];
        match target.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                req.push(ATYP_IPV4);
                req.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                req.push(ATYP_IPV6);
                req.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                if target.host.len() > 255 {
                    return Err(Error::new(ErrorKind::InvalidInput, "domain name too long"));
                }
                req.push(ATYP_DOMAIN);
                req.push(target.host.len() as u8);
                req.extend_from_slice(target.host.as_bytes());
            }
        }
        req.extend_from_slice(&target.port.to_be_bytes());
        stream.write_all(&req).await?;

        let mut resp = [0u8; 4];
        stream.read_exact(&mut resp).await?;
        if resp[0] != SOCKS5_VERSION {
            return Err(Error::new(ErrorKind::InvalidData, "bad reply version"));
        }
        if resp[1] != ReplyCode::Succeeded as u8 {
            return Err(Error::new(
                ErrorKind::ConnectionRefused,
                format!("proxy connect failed with code {}", resp[1]),
            ));
        }

        // Drain the bound address; the tunnel never uses it.
        match resp[3] {
            ATYP_IPV4 => {
                let mut skip = [0u8; 6];
                stream.read_exact(&mut skip).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut skip = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut skip).await?;
            }
            ATYP_IPV6 => {
                let mut skip = [0u8; 18];
                stream.read_exact(&mut skip).await?;
            }
            other => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown bound address type {other}"),
                ))
            }
        }
        Ok(())
    }
}

/// How the server reaches targets named on tunnel streams.
#[derive(Debug, Clone)]
pub enum TargetDialer {
    Direct,
    Socks5(Socks5Dialer),
}

impl TargetDialer {
    pub async fn dial(&self, target: &TargetAddr) -> Result<TcpStream, Error> {
        match self {
            TargetDialer::Direct => {
                let addr = target.to_string();
                let mut addrs = tokio::net::lookup_host(&addr).await?;
                match addrs.next() {
                    Some(resolved) => TcpStream::connect(resolved).await,
                    None => Err(Error::new(
                        ErrorKind::NotFound,
                        format!("no addresses for {addr}"),
                    )),
                }
            }
            TargetDialer::Socks5(dialer) => dialer.dial(target).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_parses_connect_to_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut choice = [0u8; 2];
            stream.read_exact(&mut choice).await.unwrap();
            assert_eq!(choice, [0x05, 0x00]);

            // CONNECT example.com:443
            let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
            req.extend_from_slice(b"example.com");
            req.extend_from_slice(&443u16.to_be_bytes());
            stream.write_all(&req).await.unwrap();
            stream
        });

        let (mut server_side, _) = listener.accept().await.unwrap();
        let (command, target) = socks5_handshake(&mut server_side).await.unwrap();
        assert_eq!(command, Command::Connect);
        assert_eq!(
            target,
            TargetAddr {
                host: "example.com".into(),
                port: 443
            }
        );
        client.await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_command_gets_correct_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut choice = [0u8; 2];
            stream.read_exact(&mut choice).await.unwrap();

            // UDP ASSOCIATE is not something the tunnel carries.
            let mut req = vec![0x05, 0x03, 0x00, 0x01, 1, 2, 3, 4];
            req.extend_from_slice(&53u16.to_be_bytes());
            stream.write_all(&req).await.unwrap();

            let mut reply = [0u8; 10];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
        });

        let (mut server_side, _) = listener.accept().await.unwrap();
        // UdpAssociate is parsed fine; the caller decides it is unsupported.
        let (command, _) = socks5_handshake(&mut server_side).await.unwrap();
        assert_eq!(command, Command::UdpAssociate);
        send_reply(&mut server_side, ReplyCode::CommandNotSupported, None)
            .await
            .unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn target_address_roundtrips() {
        for target in [
            TargetAddr { host: "10.0.0.1".into(), port: 80 },
            TargetAddr { host: "example.com".into(), port: 443 },
            TargetAddr { host: "2001:db8::1".into(), port: 8443 },
        ] {
            let mut buf = Vec::new();
            write_target_address(&mut buf, &target).await.unwrap();
            let parsed = read_target_address(&mut buf.as_slice()).await.unwrap();
            assert_eq!(parsed, target);
        }
    }

    #[tokio::test]
    async fn overlong_domain_rejected() {
        let target = TargetAddr {
            host: "x".repeat(300),
            port: 80,
        };
        let mut buf = Vec::new();
        assert!(write_target_address(&mut buf, &target).await.is_err());
    }

    #[test]
    fn display_brackets_ipv6() {
        let t = TargetAddr { host: "2001:db8::1".into(), port: 443 };
        assert_eq!(t.to_string(), "[2001:db8::1]:443");
        let t = TargetAddr { host: "example.com".into(), port: 80 };
        assert_eq!(t.to_string(), "example.com:80");
    }
}
