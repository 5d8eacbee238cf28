//! Minimal canned-response HTTP server for tests.
//!
//! Serves a fixed response to a bounded number of connections, optionally
//! trickling the body out in timed chunks to exercise cancellation paths.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub(crate) struct CannedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    /// When set, the body is written in `(size, delay)` pieces.
    pub trickle: Option<(usize, Duration)>,
}

impl CannedResponse {
    pub fn ok(content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type,
            body,
            trickle: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain",
            body: b"not found".to_vec(),
            trickle: None,
        }
    }

    pub fn trickled(body: Vec<u8>, size: usize, delay: Duration) -> Self {
        Self {
            status: 200,
            content_type: "application/octet-stream",
            body,
            trickle: Some((size, delay)),
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Status",
    }
}

/// Bind an ephemeral port and serve `response` to up to `max_requests`
/// connections.
pub(crate) async fn serve(response: CannedResponse, max_requests: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = Arc::new(response);

    tokio::spawn(async move {
        for _ in 0..max_requests {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let response = Arc::clone(&response);
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;

                let header = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    response.status,
                    reason(response.status),
                    response.content_type,
                    response.body.len(),
                );
                if socket.write_all(header.as_bytes()).await.is_err() {
                    return;
                }

                match response.trickle {
                    None => {
                        let _ = socket.write_all(&response.body).await;
                    }
                    Some((size, delay)) => {
                        for piece in response.body.chunks(size) {
                            if socket.write_all(piece).await.is_err() {
                                return;
                            }
                            let _ = socket.flush().await;
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}
