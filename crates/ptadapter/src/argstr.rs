//! String encodings used by the pluggable transport specification.
//!
//! These are the escaping and splitting rules from pt-spec.txt for
//! per-connection arguments (§3.5), server transport options (§3.2.3),
//! and SMETHOD `ARGS:` options (§3.3.3), along with the `host:port`
//! notation used throughout, and the identifier rules for transport
//! names (§3.1).

use std::net::Ipv6Addr;

use crate::err::{Error, Result};

/// Check that `name` is an acceptable transport name.
///
/// Transport names must be valid C identifiers: the first character is an
/// ASCII letter or underscore, and the remaining characters are ASCII
/// letters, digits or underscores.  No length limit is imposed.
pub fn validate_transport_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidTransportName(name.to_string()))
    }
}

/// Escape a key or value used in client per-connection arguments.
///
/// Backslashes, equal signs and semicolons are escaped with a backslash.
pub fn escape_per_connection_arg(s: &str) -> String {
    escape(s, &['\\', '=', ';'])
}

/// Escape a key or value used in `TOR_PT_SERVER_TRANSPORT_OPTIONS`.
///
/// Colons, semicolons, and backslashes are escaped with a backslash.
/// (Equal signs are not: the spec really does treat the two contexts
/// differently.)
pub fn escape_server_option(s: &str) -> String {
    escape(s, &[':', ';', '\\'])
}

/// Backslash-escape every occurrence of `special` in `s`.
fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Remove one level of backslash escaping from `s`.
///
/// Any character may follow a backslash; a trailing lone backslash is an
/// error.
pub fn unescape_arg(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped) => out.push(escaped),
                None => {
                    return Err(Error::MalformedArgs(format!(
                        "dangling backslash in {:?}",
                        s
                    )));
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Split `s` on every _unescaped_ occurrence of `delim`.
///
/// The returned segments still carry their escape sequences.
fn split_unescaped(s: &str, delim: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            current.push(c);
            escaped = true;
        } else if c == delim {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

/// Parse the body of an SMETHOD `ARGS:` option into key/value pairs.
///
/// The input is a `key=value,key=value` list in which equal signs and
/// commas inside keys or values are backslash-escaped.  Pairs are
/// returned in the order they appear.
pub fn parse_smethod_args(s: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for piece in split_unescaped(s, ',') {
        let mut kv = split_unescaped(&piece, '=');
        if kv.len() != 2 {
            return Err(Error::MalformedArgs(format!(
                "expected exactly one unescaped '=' in {:?}",
                piece
            )));
        }
        let value = kv.pop().map(|v| unescape_arg(&v)).transpose()?;
        let key = kv.pop().map(|k| unescape_arg(&k)).transpose()?;
        match (key, value) {
            (Some(k), Some(v)) => pairs.push((k, v)),
            _ => unreachable!("len checked above"),
        }
    }
    Ok(pairs)
}

/// Join key/value pairs into an SMETHOD `ARGS:` body.
///
/// This is the inverse of [`parse_smethod_args`]: backslashes, equal
/// signs and commas in keys and values are backslash-escaped.
pub fn join_smethod_args(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape(k, &['\\', '=', ',']));
        out.push('=');
        out.push_str(&escape(v, &['\\', '=', ',']));
    }
    out
}

/// Encode per-connection arguments for transmission in SOCKS auth fields.
///
/// Keys and values are escaped with [`escape_per_connection_arg`], joined
/// as `key=value` pairs separated by semicolons.
pub fn encode_connection_args(args: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (k, v)) in args.iter().enumerate() {
        if i > 0 {
            out.push(b';');
        }
        out.extend_from_slice(escape_per_connection_arg(k).as_bytes());
        out.push(b'=');
        out.extend_from_slice(escape_per_connection_arg(v).as_bytes());
    }
    out
}

/// Parse a `host:port` string into separate host and port.
///
/// The host may be an IPv4 address, an IPv6 address enclosed in square
/// brackets, or a host name.  The port is required, and must be nonzero.
pub fn parse_hostport(s: &str) -> Result<(String, u16)> {
    let err = || Error::InvalidHostPort(s.to_string());
    if s.contains(char::is_whitespace) {
        return Err(err());
    }
    let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(err)?;
        (host, rest.strip_prefix(':').ok_or_else(err)?)
    } else {
        let (host, port) = s.rsplit_once(':').ok_or_else(err)?;
        if host.contains(':') {
            // An unbracketed IPv6 address: ambiguous, so rejected.
            return Err(err());
        }
        (host, port)
    };
    if host.is_empty() || port_str.is_empty() || !port_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    let port: u16 = port_str.parse().map_err(|_| err())?;
    if port == 0 {
        return Err(err());
    }
    Ok((host.to_string(), port))
}

/// Combine host and port into a string of the form `host:port`.
///
/// IPv6 addresses are enclosed in square brackets.
pub fn join_hostport(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
