//! End-to-end tunnel test: plaintext in one side, through a scripted
//! "transport" whose SOCKS5 port we implement in-process, and back.
#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ptadapter::{ClientConfig, ListeningClientAdapter, PtTimeouts, TunnelConfig};

/// Wrap a shell script into an adapter command line.
fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

/// A SOCKS5 server standing in for the transport's client port: accepts
/// NO_AUTH CONNECT requests and then echoes the payload back.
async fn fake_socks5_echo(listener: TcpListener) {
    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let mut offer = [0_u8; 2];
            stream.read_exact(&mut offer).await.unwrap();
            assert_eq!(offer[0], 0x05);
            let mut methods = vec![0_u8; usize::from(offer[1])];
            stream.read_exact(&mut methods).await.unwrap();
            assert!(methods.contains(&0x00), "expected a NO_AUTH offer");
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0_u8; 4];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..3], &[0x05, 0x01, 0x00]);
            let addr_len = match head[3] {
                0x01 => 4,
                0x04 => 16,
                0x03 => {
                    let mut len = [0_u8; 1];
                    stream.read_exact(&mut len).await.unwrap();
                    usize::from(len[0])
                }
                other => panic!("unexpected ATYP {}", other),
            };
            let mut tail = vec![0_u8; addr_len + 2];
            stream.read_exact(&mut tail).await.unwrap();
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            // Past the proxy handshake: echo everything.
            let mut buf = [0_u8; 1024];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[tokio::test]
async fn tunnel_end_to_end() {
    let socks_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socks_addr = socks_listener.local_addr().unwrap();
    tokio::spawn(fake_socks5_echo(socks_listener));

    let script = format!(
        "printf '%s\\n' 'VERSION 1' 'CMETHOD mock socks5 {}' 'CMETHODS DONE'; \
         exec sleep 30",
        socks_addr,
    );
    let mut config = ClientConfig::new(sh(&script));
    config
        .tunnels
        .push(TunnelConfig::new("mock", "127.0.0.1:0", "192.0.2.7:443"));

    let mut adapter = ListeningClientAdapter::from_config(config).unwrap();
    let mut timeouts = PtTimeouts::default();
    timeouts.stdin_close = Duration::from_millis(200);
    timeouts.terminate = Duration::from_millis(200);
    adapter.set_timeouts(timeouts);

    adapter.start().await.unwrap();
    let listen_addr = adapter.listen_addrs()[0];

    // Two concurrent plaintext connections through the same tunnel.
    let mut first = TcpStream::connect(listen_addr).await.unwrap();
    let mut second = TcpStream::connect(listen_addr).await.unwrap();

    first.write_all(b"hello tunnel").await.unwrap();
    second.write_all(b"second stream").await.unwrap();

    let mut buf = [0_u8; 12];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello tunnel");
    let mut buf = [0_u8; 13];
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"second stream");

    adapter.stop().await.unwrap();

    // The listener is gone once the adapter has stopped.
    assert!(TcpStream::connect(listen_addr).await.is_err());
}
