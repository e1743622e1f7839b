//! Client-side SOCKS4 and SOCKS5 negotiation against a pluggable
//! transport's proxy port.
//!
//! Pluggable transports abuse the SOCKS authentication fields as an
//! argument channel (pt-spec.txt §3.5): per-connection key/value
//! arguments are serialized into the SOCKS5 username/password, or the
//! SOCKS4 USERID.  We therefore implement only the subset of SOCKS that
//! transports actually speak: the CONNECT command, one offered auth
//! method, and the three SOCKS5 address types.

use std::net::{Ipv4Addr, Ipv6Addr};

use caret::caret_int;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::argstr;
use crate::err::ConnectError;

caret_int! {
    /// Status code in a SOCKS5 server reply (RFC 1928 §6).
    pub struct Socks5Reply(u8) {
        /// The request succeeded.
        SUCCEEDED = 0x00,
        /// General SOCKS server failure.
        GENERAL_FAILURE = 0x01,
        /// Connection not allowed by ruleset.
        NOT_ALLOWED = 0x02,
        /// Network unreachable.
        NETWORK_UNREACHABLE = 0x03,
        /// Host unreachable.
        HOST_UNREACHABLE = 0x04,
        /// Connection refused.
        CONNECTION_REFUSED = 0x05,
        /// TTL expired.
        TTL_EXPIRED = 0x06,
        /// Command not supported.
        COMMAND_NOT_SUPPORTED = 0x07,
        /// Address type not supported.
        ADDRESS_TYPE_NOT_SUPPORTED = 0x08,
    }
}

caret_int! {
    /// Status code in a SOCKS4 server reply.
    ///
    /// Apart from GRANTED, these are all rejections.  Expect transports
    /// to be unimaginative and only ever send REJECTED_OR_FAILED.
    pub struct Socks4Reply(u8) {
        /// Request granted.
        GRANTED = 0x5a,
        /// Request rejected or failed.
        REJECTED_OR_FAILED = 0x5b,
        /// Request rejected because the identd server was unreachable.
        NO_IDENTD = 0x5c,
        /// Request rejected because the reported user ids did not match.
        USER_ID_MISMATCH = 0x5d,
    }
}

/// The SOCKS5 version byte.
const SOCKS5_VERSION: u8 = 0x05;
/// The SOCKS4 version byte.
const SOCKS4_VERSION: u8 = 0x04;
/// SOCKS5 "no authentication required" method.
const AUTH_NO_AUTH: u8 = 0x00;
/// SOCKS5 username/password method (RFC 1929).
const AUTH_USERNAME_PASSWORD: u8 = 0x02;
/// The CONNECT command, in both SOCKS versions.
const CMD_CONNECT: u8 = 0x01;
/// SOCKS5 address type: IPv4.
const ATYP_IPV4: u8 = 0x01;
/// SOCKS5 address type: domain name.
const ATYP_DOMAIN: u8 = 0x03;
/// SOCKS5 address type: IPv6.
const ATYP_IPV6: u8 = 0x04;

/// The most bytes of encoded arguments a SOCKS5 handshake can carry:
/// a full 255-byte username plus a full 255-byte password.
const MAX_ARGS_LEN: usize = 255 * 2;

/// Split encoded per-connection arguments into RFC 1929 username and
/// password fields.
///
/// The username takes the first 255 bytes; the password takes the rest.
/// An empty password is replaced by a single NUL, since RFC 1929 does
/// not allow zero-length fields.
///
/// The caller must have checked the length against [`MAX_ARGS_LEN`].
fn split_userpass(encoded: &[u8]) -> (&[u8], &[u8]) {
    debug_assert!(encoded.len() <= MAX_ARGS_LEN);
    let split = encoded.len().min(255);
    let (username, password) = encoded.split_at(split);
    if password.is_empty() {
        (username, b"\x00")
    } else {
        (username, password)
    }
}

/// Encode `host` as a SOCKS5 address (ATYP byte plus address body).
///
/// IP literals become ATYP 0x01/0x04; anything else is IDNA-encoded and
/// sent as a domain name, which must fit in 255 bytes.
fn socks5_addr(host: &str) -> Result<Vec<u8>, ConnectError> {
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        let mut out = vec![ATYP_IPV4];
        out.extend_from_slice(&v4.octets());
        Ok(out)
    } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
        let mut out = vec![ATYP_IPV6];
        out.extend_from_slice(&v6.octets());
        Ok(out)
    } else {
        let ascii = idna::domain_to_ascii(host)
            .map_err(|_| ConnectError::BadHostname(host.to_string()))?;
        if ascii.len() > 255 {
            return Err(ConnectError::HostnameTooLong);
        }
        let mut out = vec![ATYP_DOMAIN, ascii.len() as u8];
        out.extend_from_slice(ascii.as_bytes());
        Ok(out)
    }
}

/// Negotiate SOCKS5 on `stream` for a CONNECT to `host:port`.
///
/// If `args` is nonempty, it is carried to the transport in a
/// username/password sub-negotiation; otherwise we offer NO_AUTH.  On
/// success the proxy's reply has been consumed entirely, and the next
/// bytes on the stream belong to the destination.
pub(crate) async fn negotiate_socks5<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    args: &[(String, String)],
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if args.is_empty() {
        stream
            .write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
            .await?;
        let mut buf = [0_u8; 2];
        stream.read_exact(&mut buf).await?;
        check_socks5_version(buf[0])?;
        if buf[1] != AUTH_NO_AUTH {
            return Err(ConnectError::SocksProto(format!(
                "proxy rejected NO_AUTH, offered method {:#04x}",
                buf[1]
            )));
        }
    } else {
        let encoded = argstr::encode_connection_args(args);
        if encoded.len() > MAX_ARGS_LEN {
            return Err(ConnectError::ArgsTooLong);
        }
        let (username, password) = split_userpass(&encoded);

        stream
            .write_all(&[SOCKS5_VERSION, 1, AUTH_USERNAME_PASSWORD])
            .await?;
        let mut buf = [0_u8; 2];
        stream.read_exact(&mut buf).await?;
        check_socks5_version(buf[0])?;
        if buf[1] != AUTH_USERNAME_PASSWORD {
            return Err(ConnectError::SocksProto(format!(
                "proxy rejected username/password auth, offered method {:#04x}",
                buf[1]
            )));
        }

        // RFC 1929 sub-negotiation, version 1.
        let mut subneg = Vec::with_capacity(3 + username.len() + password.len());
        subneg.push(0x01);
        subneg.push(username.len() as u8);
        subneg.extend_from_slice(username);
        subneg.push(password.len() as u8);
        subneg.extend_from_slice(password);
        stream.write_all(&subneg).await?;

        let mut buf = [0_u8; 2];
        stream.read_exact(&mut buf).await?;
        if buf[0] != 0x01 {
            return Err(ConnectError::SocksProto(format!(
                "bad username/password sub-negotiation version {:#04x}",
                buf[0]
            )));
        }
        if buf[1] != 0 {
            return Err(ConnectError::SocksProto(format!(
                "proxy rejected username/password, status {:#04x}",
                buf[1]
            )));
        }
    }

    let addr = socks5_addr(host)?;
    let mut request = Vec::with_capacity(6 + addr.len());
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
    request.extend_from_slice(&addr);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0_u8; 4];
    stream.read_exact(&mut head).await?;
    check_socks5_version(head[0])?;
    let reply = Socks5Reply::from(head[1]);
    if reply != Socks5Reply::SUCCEEDED {
        return Err(ConnectError::Socks5Rejected(reply));
    }
    if head[2] != 0 {
        return Err(ConnectError::SocksProto(format!(
            "nonzero RSV field {:#04x} in reply",
            head[2]
        )));
    }
    // Drain the bound address and port; nobody cares what they are.
    let tail_len = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0_u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(ConnectError::SocksProto(format!(
                "unknown address type {:#04x} in reply",
                other
            )));
        }
    };
    let mut tail = vec![0_u8; tail_len];
    stream.read_exact(&mut tail).await?;
    Ok(())
}

/// Negotiate SOCKS4 on `stream` for a CONNECT to `host:port`.
///
/// SOCKS4 supports only IPv4 destinations.  The encoded arguments ride
/// in the USERID field, which has no length limit in the spec.
pub(crate) async fn negotiate_socks4<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    args: &[(String, String)],
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ip: Ipv4Addr = host.parse().map_err(|_| ConnectError::NotIpv4)?;
    let encoded = argstr::encode_connection_args(args);

    let mut request = Vec::with_capacity(9 + encoded.len());
    request.extend_from_slice(&[SOCKS4_VERSION, CMD_CONNECT]);
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(&encoded);
    request.push(0x00);
    stream.write_all(&request).await?;

    let mut reply = [0_u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0 {
        return Err(ConnectError::SocksProto(format!(
            "bad SOCKS4 reply version {:#04x}",
            reply[0]
        )));
    }
    let status = Socks4Reply::from(reply[1]);
    if status != Socks4Reply::GRANTED {
        return Err(ConnectError::Socks4Rejected(status));
    }
    Ok(())
}

/// Complain unless `version` is the SOCKS5 version byte.
fn check_socks5_version(version: u8) -> Result<(), ConnectError> {
    if version != SOCKS5_VERSION {
        return Err(ConnectError::SocksProto(format!(
            "bad SOCKS version {:#04x}",
            version
        )));
    }
    Ok(())
}
