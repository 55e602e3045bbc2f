//! End-to-end tests of the reqwest transport against a local HTTP server

mod common;

use common::{wait_for, wait_for_progress};
use odm_embed::downloader::HttpTransport;
use odm_embed::integrity::sha256_sum;
use odm_embed::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn body() -> Vec<u8> {
    (0..64 * 1024u32).map(|i| (i % 251) as u8).collect()
}

async fn respond(mut sock: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let request = String::from_utf8_lossy(&buf).to_string();
    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

    match path.as_str() {
        "/file.bin" => {
            let body = body();
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = sock.write_all(head.as_bytes()).await;
            let _ = sock.write_all(&body).await;
            let _ = sock.shutdown().await;
        }
        "/slow.bin" => {
            let head = "HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\nConnection: close\r\n\r\n";
            let _ = sock.write_all(head.as_bytes()).await;
            let _ = sock.write_all(&[7u8; 1000]).await;
            let _ = sock.flush().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        _ => {
            let _ = sock
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            let _ = sock.shutdown().await;
        }
    }
}

async fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            tokio::spawn(respond(sock));
        }
    });
    addr
}

async fn http_manager(dir: &TempDir) -> DownloadManager {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let transport = Arc::new(HttpTransport::with_client(client));
    let store = StateManager::new(&dir.path().join("downloads.db")).await.unwrap();
    DownloadManager::new(store, transport, dir.path().join("tmp"))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn downloads_into_temp_file_then_moves() {
    let addr = spawn_server().await;
    let dir = TempDir::new().unwrap();
    let manager = http_manager(&dir).await;
    let dest = dir.path().join("out/file.bin");

    let handle = manager
        .start(&format!("http://{}/file.bin", addr), &dest)
        .await
        .unwrap();
    wait_for(&manager, handle, |s| *s == TransferStatus::Completed).await;

    let record = manager.record(handle).await.unwrap();
    assert_eq!(record.downloaded_bytes, body().len() as u64);
    assert_eq!(record.total_bytes, Some(body().len() as u64));
    assert!(!dest.exists());

    let expected = sha256_sum(&record.temp_location).await.unwrap();
    assert!(manager.verify_file(handle, &expected).await.unwrap());

    assert!(manager.move_file(handle, "").await);
    assert_eq!(std::fs::read(&dest).unwrap(), body());
    assert!(!record.temp_location.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn http_error_status_fails_the_transfer() {
    let addr = spawn_server().await;
    let dir = TempDir::new().unwrap();
    let manager = http_manager(&dir).await;

    let handle = manager
        .start(&format!("http://{}/missing.bin", addr), dir.path().join("m"))
        .await
        .unwrap();
    wait_for(&manager, handle, |s| *s == TransferStatus::Failed).await;
    assert_eq!(manager.error(handle).await, "http status 404");
    assert!(!manager.record(handle).await.unwrap().temp_location.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connection_fails_the_transfer() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let dir = TempDir::new().unwrap();
    let manager = http_manager(&dir).await;

    let handle = manager
        .start(&format!("http://127.0.0.1:{}/x", port), dir.path().join("x"))
        .await
        .unwrap();
    wait_for(&manager, handle, |s| *s == TransferStatus::Failed).await;
    assert!(!manager.error(handle).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_cancels_a_running_download() {
    let addr = spawn_server().await;
    let dir = TempDir::new().unwrap();
    let manager = http_manager(&dir).await;

    let handle = manager
        .start(&format!("http://{}/slow.bin", addr), dir.path().join("slow"))
        .await
        .unwrap();
    wait_for_progress(&manager, handle, 0.0005).await;
    let temp = manager.record(handle).await.unwrap().temp_location;

    manager.cleanup(handle).await;
    assert_eq!(manager.status(handle).await, TransferStatus::NotFound);

    for _ in 0..500 {
        if !temp.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!temp.exists());
    assert_eq!(manager.status(handle).await, TransferStatus::NotFound);
}
