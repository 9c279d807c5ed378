use std::net::SocketAddr;

use relay_utils::proxy::{AdminRouter, HttpProxy};
use relay_utils::tcp::TcpDialer;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

async fn spawn_proxy(shutdown: CancellationToken) -> SocketAddr {
    let mut router = AdminRouter::new();
    router.route("/ping", || json!({ "pong": true }));
    let proxy = HttpProxy::bind("127.0.0.1:0", Box::new(TcpDialer::new()), router)
        .await
        .unwrap();
    let addr = proxy.local_addr().unwrap();
    tokio::spawn(proxy.serve(shutdown));
    addr
}

/// Answers every request with the request head it received.
async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    head.push_str(&line);
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    head.len(),
                    head
                );
                let _ = reader.get_mut().write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

async fn exchange(proxy: SocketAddr, request: &str) -> String {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_absolute_form_is_rewritten() {
    let shutdown = CancellationToken::new();
    let proxy = spawn_proxy(shutdown.clone()).await;
    let origin = spawn_origin().await;

    let request = format!(
        "GET http://{origin}/hello?x=1 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    let response = exchange(proxy, &request).await;

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("GET /hello?x=1 HTTP/1.1\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(!response.contains("Proxy-Connection"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_connect_opens_raw_tunnel() {
    let shutdown = CancellationToken::new();
    let proxy = spawn_proxy(shutdown.clone()).await;
    let origin = spawn_origin().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {origin} HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut reader = BufReader::new(client);
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();
    assert!(status.starts_with("HTTP/1.1 200"));
    let mut blank = String::new();
    reader.read_line(&mut blank).await.unwrap();
    assert_eq!(blank, "\r\n");

    reader
        .get_mut()
        .write_all(b"GET /inner HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    reader.read_line(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_origin_form_goes_to_admin_router() {
    let shutdown = CancellationToken::new();
    let proxy = spawn_proxy(shutdown.clone()).await;

    let response = exchange(proxy, "GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("application/json"));
    assert!(response.contains("\"pong\": true"));

    let response = exchange(proxy, "GET /nowhere HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_upstream_gets_bad_gateway() {
    let shutdown = CancellationToken::new();
    let proxy = spawn_proxy(shutdown.clone()).await;
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

    let response = exchange(proxy, &format!("CONNECT {closed} HTTP/1.1\r\n\r\n")).await;
    assert!(response.starts_with("HTTP/1.1 502"));

    shutdown.cancel();
}
