//! Idle-timeout behavior over real TCP, through the listener and the
//! worker threads.

mod common;

use std::time::Duration;

use bytes::BytesMut;
use common::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

#[tokio::test]
async fn test_silent_connection_is_aborted() {
    let server = spawn_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    sleep(past_idle()).await;

    assert!(connection_was_reset(&mut stream).await);
    assert_eq!(connection_counts(&server.engine).await, vec![0, 0]);
}

#[tokio::test]
async fn test_connection_survives_inside_idle_window() {
    let server = spawn_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = BytesMut::new();

    sleep(within_idle()).await;
    let response = get(&mut stream, &mut buf, "/early").await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"/early");
}

#[tokio::test]
async fn test_idle_keep_alive_connection_is_aborted_between_requests() {
    let server = spawn_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = BytesMut::new();

    let response = get(&mut stream, &mut buf, "/").await.unwrap();
    assert_eq!(response.status, 200);

    sleep(past_idle()).await;

    assert!(connection_was_reset(&mut stream).await);
}

#[tokio::test]
async fn test_requests_spaced_inside_window_never_time_out() {
    let server = spawn_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = BytesMut::new();

    // Total time well past one idle window; responses are read afterwards.
    let count = 6;
    for i in 0..count {
        stream
            .write_all(format!("GET /req-{i} HTTP/1.1\r\nHost: test\r\n\r\n").as_bytes())
            .await
            .unwrap();
        sleep(within_idle()).await;
    }

    for i in 0..count {
        let response = read_response(&mut stream, &mut buf).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, format!("/req-{i}").into_bytes());
    }
}

#[tokio::test]
async fn test_slow_request_body_completes() {
    let server = spawn_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = BytesMut::new();

    let body = b"trickle-body";
    stream
        .write_all(format!("POST /echo HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len()).as_bytes())
        .await
        .unwrap();

    for byte in body {
        sleep(Duration::from_millis(IDLE_MS / 3)).await;
        stream.write_all(&[*byte]).await.unwrap();
    }

    let response = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, body);
}

#[tokio::test]
async fn test_slow_chunked_request_body_completes() {
    let server = spawn_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = BytesMut::new();

    stream
        .write_all(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .unwrap();

    let wire = b"3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n";
    for piece in wire.chunks(5) {
        sleep(Duration::from_millis(IDLE_MS / 3)).await;
        stream.write_all(piece).await.unwrap();
    }

    let response = read_response(&mut stream, &mut buf).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"abcdefg");
}

#[tokio::test]
async fn test_slow_streamed_response_completes() {
    let server = spawn_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = BytesMut::new();

    let n = 6;
    let gap = IDLE_MS / 2;
    let response = get(&mut stream, &mut buf, &format!("/stream?n={n}&gap={gap}"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("Transfer-Encoding"), Some("chunked"));
    assert_eq!(response.chunks, vec![8; n]);

    let expected: String = (0..n).map(|i| format!("chunk-{i}\n")).collect();
    assert_eq!(response.body, expected.into_bytes());

    // The terminating chunk was consumed and the connection is reusable.
    let next = get(&mut stream, &mut buf, "/after-stream").await.unwrap();
    assert_eq!(next.body, b"/after-stream");
}

#[tokio::test]
async fn test_upgraded_connection_is_never_timed_out() {
    let server = spawn_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = BytesMut::new();

    stream
        .write_all(b"GET /upgrade HTTP/1.1\r\nHost: test\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();
    let (status, headers) = read_head(&mut stream, &mut buf).await.unwrap();
    assert_eq!(status, 101);
    assert!(headers.has_token("Connection", "upgrade"));

    for message in [&b"first"[..], &b"second"[..]] {
        sleep(past_idle()).await;
        stream.write_all(message).await.unwrap();

        let mut echoed = vec![0u8; message.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, message);
    }
}
