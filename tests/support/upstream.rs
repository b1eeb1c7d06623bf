use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
enum OriginBehavior {
    /// Write the response in the given pieces, pausing between them.
    Respond {
        chunks: Arc<Vec<Vec<u8>>>,
        pause: StdDuration,
    },
    /// Accept and read the request but never answer.
    Silent,
    /// Close immediately after reading the request.
    Empty,
}

/// Scripted origin server that records every request it receives.
pub struct TestOrigin {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    handle: JoinHandle<()>,
}

impl TestOrigin {
    pub async fn respond(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::chunked(vec![response.into()], StdDuration::ZERO).await
    }

    pub async fn http_ok(body: &str) -> Result<Self> {
        Self::respond(ok_response(body)).await
    }

    pub async fn chunked(chunks: Vec<Vec<u8>>, pause: StdDuration) -> Result<Self> {
        Self::spawn(OriginBehavior::Respond {
            chunks: Arc::new(chunks),
            pause,
        })
        .await
    }

    pub async fn silent() -> Result<Self> {
        Self::spawn(OriginBehavior::Silent).await
    }

    pub async fn empty() -> Result<Self> {
        Self::spawn(OriginBehavior::Empty).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().clone()
    }

    /// Stop accepting connections; the port is released.
    pub async fn stop(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }

    async fn spawn(behavior: OriginBehavior) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let conn_counter = connections.clone();
        let request_log = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                conn_counter.fetch_add(1, Ordering::SeqCst);
                let behavior = behavior.clone();
                let request_log = request_log.clone();
                tokio::spawn(async move {
                    let request = read_request_head(&mut stream).await;
                    request_log.lock().push(request);
                    let _ = handle_connection(&mut stream, behavior).await;
                });
            }
        });
        Ok(Self {
            addr,
            connections,
            requests,
            handle,
        })
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

async fn read_request_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    }
    data
}

async fn handle_connection(stream: &mut TcpStream, behavior: OriginBehavior) -> Result<()> {
    match behavior {
        OriginBehavior::Respond { chunks, pause } => {
            for (idx, chunk) in chunks.iter().enumerate() {
                if idx > 0 && !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                stream.write_all(chunk).await?;
                stream.flush().await?;
            }
            stream.shutdown().await.ok();
        }
        OriginBehavior::Silent => {
            tokio::time::sleep(StdDuration::from_secs(60)).await;
        }
        OriginBehavior::Empty => {
            stream.shutdown().await.ok();
        }
    }
    Ok(())
}
