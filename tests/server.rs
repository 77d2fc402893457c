//! End-to-end tests: tokio clients against a running echo server.

use mqlink::{Config, EchoCodec, Server};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_test::assert_ok;

fn start_server(io_threads: usize) -> Server {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        io_threads,
        no_delay: true,
        ..Config::default()
    };
    Server::start(&config, Arc::new(EchoCodec)).unwrap()
}

async fn stop_server(server: Server) {
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_echo_round_trip() {
    let server = start_server(1);
    let mut client = assert_ok!(TcpStream::connect(server.local_addr()).await);

    client.write_all(b"CONNECT").await.unwrap();
    let mut buf = [0u8; 7];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"CONNECT");

    drop(client);
    stop_server(server).await;
}

#[tokio::test]
async fn test_large_payload_arrives_in_order() {
    let server = start_server(2);
    let client = TcpStream::connect(server.local_addr()).await.unwrap();
    let (mut reader, mut writer) = client.into_split();

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let send = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(30), reader.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert!(received == expected, "echoed bytes differ from the payload");

    let _writer = send.await.unwrap();
    assert!(server.stats().bytes_written.load(Ordering::Relaxed) >= expected.len() as u64);
    stop_server(server).await;
}

#[tokio::test]
async fn test_half_close_flushes_then_closes() {
    let server = start_server(1);
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    client.write_all(b"last words").await.unwrap();
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"last words");

    stop_server(server).await;
}

#[tokio::test]
async fn test_connection_stats_track_lifetime() {
    let server = start_server(1);
    let client = TcpStream::connect(server.local_addr()).await.unwrap();

    assert!(wait_until(|| server.stats().active_connections.load(Ordering::Relaxed) == 1).await);
    assert_eq!(server.stats().connections_accepted.load(Ordering::Relaxed), 1);

    drop(client);
    assert!(wait_until(|| server.stats().active_connections.load(Ordering::Relaxed) == 0).await);
    assert_eq!(server.stats().connections_accepted.load(Ordering::Relaxed), 1);

    stop_server(server).await;
}

#[tokio::test]
async fn test_many_concurrent_clients() {
    let server = start_server(4);
    let addr = server.local_addr();

    let mut tasks = Vec::new();
    for id in 0..32u32 {
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let message = format!("client-{}", id);
            client.write_all(message.as_bytes()).await.unwrap();

            let mut buf = vec![0u8; message.len()];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, message.as_bytes());
        }));
    }

    for task in tasks {
        timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(server.stats().connections_accepted.load(Ordering::Relaxed), 32);
    stop_server(server).await;
}
