//! End-to-end ExtOrPort tests: we play the transport's side of the
//! SafeCookie handshake and client-info phase against a real adapter.
#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use ptadapter::{ExtOrClientInfo, ExtServerAdapter, PtTimeouts};

/// Domain-separation prefix for the server-to-client hash.
const SERVER_HASH_HEADER: &[u8] = b"ExtORPort authentication server-to-client hash";
/// Domain-separation prefix for the client-to-server hash.
const CLIENT_HASH_HEADER: &[u8] = b"ExtORPort authentication client-to-server hash";

/// Wrap a shell script into an adapter command line.
fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Timeouts short enough to keep shutdown brisk.
fn fast_timeouts() -> PtTimeouts {
    let mut timeouts = PtTimeouts::default();
    timeouts.stdin_close = Duration::from_millis(200);
    timeouts.terminate = Duration::from_millis(200);
    timeouts
}

/// A server-side fake transport that stays alive until stopped.
fn fake_server_pt() -> Vec<String> {
    sh("printf '%s\\n' 'VERSION 1' 'SMETHOD obfs4 127.0.0.1:7777' 'SMETHODS DONE'; \
        exec sleep 30")
}

/// HMAC-SHA256 of `parts` keyed with `cookie`.
fn keyed_hash(cookie: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(cookie).unwrap();
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Run the transport's half of the SafeCookie handshake.  Returns the
/// status byte the server sent.
async fn safecookie_client(stream: &mut TcpStream, cookie: &[u8], corrupt: bool) -> u8 {
    // Offered auth types, terminated by 0; SafeCookie must be offered.
    let mut offered = Vec::new();
    loop {
        let mut ty = [0_u8; 1];
        stream.read_exact(&mut ty).await.unwrap();
        if ty[0] == 0x00 {
            break;
        }
        offered.push(ty[0]);
    }
    assert!(offered.contains(&0x01));
    stream.write_all(&[0x01]).await.unwrap();

    let client_nonce = [0x2a_u8; 32];
    stream.write_all(&client_nonce).await.unwrap();

    let mut server_hash = [0_u8; 32];
    stream.read_exact(&mut server_hash).await.unwrap();
    let mut server_nonce = [0_u8; 32];
    stream.read_exact(&mut server_nonce).await.unwrap();

    // The server must prove cookie possession too.
    let expected =
        keyed_hash(cookie, &[SERVER_HASH_HEADER, &client_nonce, &server_nonce]);
    assert_eq!(server_hash, expected);

    let mut client_hash =
        keyed_hash(cookie, &[CLIENT_HASH_HEADER, &client_nonce, &server_nonce]);
    if corrupt {
        client_hash[0] ^= 0x01;
    }
    stream.write_all(&client_hash).await.unwrap();

    let mut status = [0_u8; 1];
    stream.read_exact(&mut status).await.unwrap();
    status[0]
}

/// Send one framed ExtOrPort command.
async fn send_command(stream: &mut TcpStream, command: u16, body: &[u8]) {
    let mut msg = Vec::with_capacity(4 + body.len());
    msg.extend_from_slice(&command.to_be_bytes());
    msg.extend_from_slice(&(body.len() as u16).to_be_bytes());
    msg.extend_from_slice(body);
    stream.write_all(&msg).await.unwrap();
}

/// Read one framed ExtOrPort reply, returning the command word.
async fn read_reply(stream: &mut TcpStream) -> u16 {
    let mut head = [0_u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!([head[2], head[3]], [0, 0], "replies carry no body");
    u16::from_be_bytes([head[0], head[1]])
}

/// Read the adapter's cookie file, checking its fixed layout.
fn read_cookie(adapter: &ExtServerAdapter) -> Vec<u8> {
    let contents = std::fs::read(adapter.auth_cookie_file().unwrap()).unwrap();
    assert_eq!(contents.len(), 64);
    assert_eq!(&contents[..32], b"! Extended ORPort Auth Cookie !\n");
    contents[32..].to_vec()
}

#[tokio::test]
async fn ext_or_port_end_to_end() {
    let (tx, mut rx) = mpsc::channel::<(TcpStream, ExtOrClientInfo)>(1);
    let mut adapter = ExtServerAdapter::new(fake_server_pt(), None, move |stream, info| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((stream, info)).await;
        }
    })
    .unwrap();
    adapter.set_timeouts(fast_timeouts());
    adapter.add_transport("obfs4", None, Vec::new()).unwrap();
    adapter.start().await.unwrap();

    let cookie = read_cookie(&adapter);
    let ext_addr = adapter.ext_or_port().unwrap();

    let mut stream = TcpStream::connect(ext_addr).await.unwrap();
    let status = safecookie_client(&mut stream, &cookie, false).await;
    assert_eq!(status, 0x01);

    send_command(&mut stream, 0x0002, b"obfs4").await; // TRANSPORT
    send_command(&mut stream, 0x0001, b"1.2.3.4:9999").await; // USERADDR
    send_command(&mut stream, 0x0000, b"").await; // DONE
    assert_eq!(read_reply(&mut stream).await, 0x1000); // OKAY

    let (mut delivered, info) = rx.recv().await.unwrap();
    assert_eq!(info.transport.as_deref(), Some("obfs4"));
    assert_eq!(info.host, Some("1.2.3.4".parse().unwrap()));
    assert_eq!(info.port, Some(9999));

    // Application bytes flow only now, through the delivered stream.
    stream.write_all(b"payload").await.unwrap();
    let mut buf = [0_u8; 7];
    delivered.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"payload");
    delivered.write_all(b"answer").await.unwrap();
    let mut buf = [0_u8; 6];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"answer");

    let cookie_path = adapter.auth_cookie_file().unwrap();
    adapter.stop().await.unwrap();
    // The cookie file is gone once the adapter has stopped.
    assert!(!cookie_path.exists());
}

#[tokio::test]
async fn preconnect_can_deny() {
    let (tx, mut rx) = mpsc::channel::<(TcpStream, ExtOrClientInfo)>(1);
    let mut adapter = ExtServerAdapter::new(fake_server_pt(), None, move |stream, info| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((stream, info)).await;
        }
    })
    .unwrap();
    adapter.set_preconnect(|info| async move { info.transport.as_deref() != Some("obfs4") });
    adapter.set_timeouts(fast_timeouts());
    adapter.add_transport("obfs4", None, Vec::new()).unwrap();
    adapter.start().await.unwrap();

    let cookie = read_cookie(&adapter);
    let mut stream = TcpStream::connect(adapter.ext_or_port().unwrap())
        .await
        .unwrap();
    assert_eq!(safecookie_client(&mut stream, &cookie, false).await, 0x01);
    send_command(&mut stream, 0x0002, b"obfs4").await;
    send_command(&mut stream, 0x0000, b"").await;
    assert_eq!(read_reply(&mut stream).await, 0x1001); // DENY

    // The connection is dropped, and the callback never ran.
    let mut buf = [0_u8; 1];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    assert!(rx.try_recv().is_err());

    adapter.stop().await.unwrap();
}

#[tokio::test]
async fn bad_client_hash_is_rejected() {
    let mut adapter =
        ExtServerAdapter::new(fake_server_pt(), None, |_stream, _info| async {}).unwrap();
    adapter.set_timeouts(fast_timeouts());
    adapter.add_transport("obfs4", None, Vec::new()).unwrap();
    adapter.start().await.unwrap();

    let cookie = read_cookie(&adapter);
    let mut stream = TcpStream::connect(adapter.ext_or_port().unwrap())
        .await
        .unwrap();
    let status = safecookie_client(&mut stream, &cookie, true).await;
    assert_eq!(status, 0x00);

    // No commands are accepted after a failed handshake.
    let mut buf = [0_u8; 1];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

    adapter.stop().await.unwrap();
}
