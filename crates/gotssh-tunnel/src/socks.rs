//! SOCKS5 (RFC 1928) negotiation
//!
//! The server half backs dynamic forwards: no authentication, CONNECT
//! only, IPv4/IPv6/domain addresses. The client half dials the SSH server
//! through a proxy, with optional username/password auth (RFC 1929).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use gotssh_core::config::ProxyConfig;
use gotssh_core::Endpoint;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const USER_PASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressNotSupported = 0x08,
}

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported SOCKS version {0:#04x}")]
    Version(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Proxy rejected credentials")]
    AuthRejected,

    #[error("Unsupported command {0:#04x}")]
    Command(u8),

    #[error("Unsupported address type {0:#04x}")]
    AddressType(u8),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Proxy replied {0:#04x}")]
    Reply(u8),
}

/// Run the server side of the handshake and return the requested target.
///
/// Protocol violations are answered with the matching failure reply before
/// the error is returned. On success the caller must finish with
/// [`send_reply`].
pub async fn accept<S>(stream: &mut S) -> Result<Endpoint, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(SocksError::Version(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    stream.write_all(&[SOCKS_VERSION, AUTH_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        send_reply(stream, Reply::GeneralFailure).await?;
        return Err(SocksError::Version(request[0]));
    }
    if request[1] != CMD_CONNECT {
        send_reply(stream, Reply::CommandNotSupported).await?;
        return Err(SocksError::Command(request[1]));
    }

    let host = match request[3] {
        ADDR_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ADDR_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        ADDR_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) => name,
                Err(_) => {
                    send_reply(stream, Reply::AddressNotSupported).await?;
                    return Err(SocksError::Address("non-UTF-8 domain".into()));
                }
            }
        }
        other => {
            send_reply(stream, Reply::AddressNotSupported).await?;
            return Err(SocksError::AddressType(other));
        }
    };
    let port = stream.read_u16().await?;

    Ok(Endpoint::new(host, port))
}

/// Send a reply to a CONNECT request. The bound address is always reported
/// as `0.0.0.0:0`.
pub async fn send_reply<S>(stream: &mut S, reply: Reply) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, reply as u8, 0x00, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Run the client side of the handshake on an already connected stream.
pub async fn connect<S>(
    stream: &mut S,
    target: &Endpoint,
    credentials: Option<(&str, &str)>,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match credentials {
        Some(_) => {
            stream
                .write_all(&[SOCKS_VERSION, 2, AUTH_NO_AUTH, AUTH_USER_PASS])
                .await?
        }
        None => stream.write_all(&[SOCKS_VERSION, 1, AUTH_NO_AUTH]).await?,
    }

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(SocksError::Version(choice[0]));
    }
    match (choice[1], credentials) {
        (AUTH_NO_AUTH, _) => {}
        (AUTH_USER_PASS, Some((user, pass))) => login(stream, user, pass).await?,
        _ => return Err(SocksError::NoAcceptableMethod),
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ADDR_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ADDR_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = target.host.as_bytes();
            if name.is_empty() || name.len() > 255 {
                return Err(SocksError::Address(target.host.clone()));
            }
            request.push(ADDR_DOMAIN);
            request.push(name.len() as u8);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(SocksError::Version(reply[0]));
    }
    if reply[1] != Reply::Succeeded as u8 {
        return Err(SocksError::Reply(reply[1]));
    }

    // Bound address is of no use to us, drain it.
    let skip = match reply[3] {
        ADDR_IPV4 => 4,
        ADDR_IPV6 => 16,
        ADDR_DOMAIN => stream.read_u8().await? as usize,
        other => return Err(SocksError::AddressType(other)),
    };
    let mut rest = vec![0u8; skip + 2];
    stream.read_exact(&mut rest).await?;

    Ok(())
}

async fn login<S>(stream: &mut S, user: &str, pass: &str) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if user.len() > 255 || pass.len() > 255 {
        return Err(SocksError::Address("credentials longer than 255 bytes".into()));
    }
    let mut msg = vec![USER_PASS_VERSION, user.len() as u8];
    msg.extend_from_slice(user.as_bytes());
    msg.push(pass.len() as u8);
    msg.extend_from_slice(pass.as_bytes());
    stream.write_all(&msg).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(SocksError::AuthRejected);
    }
    Ok(())
}

/// Dial `target` through a SOCKS5 proxy.
pub async fn connect_via(proxy: &ProxyConfig, target: &Endpoint) -> Result<TcpStream, SocksError> {
    debug!(proxy = %format!("{}:{}", proxy.host, proxy.port), %target, "Dialing through SOCKS5 proxy");
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

    let credentials = match (&proxy.username, &proxy.password) {
        (Some(user), pass) => Some((user.as_str(), pass.as_deref().unwrap_or(""))),
        (None, _) => None,
    };
    connect(&mut stream, target, credentials).await?;
    Ok(stream)
}
