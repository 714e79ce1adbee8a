//! Shared helpers for the proxy integration tests: an in-memory client
//! connection to the engine and scripted loopback backends.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use poxy::config::Config;
use poxy::context::ProxyContext;
use poxy::http::connection::Connection;
use poxy::http::header::{self, Header};
use poxy::http::parser::{self, LineRead, StatusLine};
use poxy::http::request::Request;
use poxy::http::transfer::{self, BodyLength};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub type Client = BufReader<DuplexStream>;

pub fn context(yaml: &str) -> Arc<ProxyContext> {
    let cfg = Config::from_yaml_str(yaml).unwrap();
    Arc::new(ProxyContext::from_config(&cfg).unwrap())
}

/// Runs one proxy connection over an in-memory stream.
pub fn start_proxy(ctx: Arc<ProxyContext>) -> (Client, JoinHandle<poxy::error::Result<()>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(Connection::new(1, server, ctx).run());
    (BufReader::new(client), task)
}

pub async fn send(client: &mut Client, bytes: &[u8]) {
    client.write_all(bytes).await.unwrap();
    client.flush().await.unwrap();
}

#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusLine,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header::find(&self.headers, name).map(|h| h.value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Reads one response. Chunked bodies are returned in their raw wire form.
pub async fn read_response(client: &mut Client, head: bool) -> TestResponse {
    let line = match parser::read_line(client).await.unwrap() {
        LineRead::Line(line) => line,
        LineRead::Eof => panic!("connection closed before response"),
    };
    let status = parser::parse_status_line(&line).unwrap();
    let headers = parser::read_headers(client).await.unwrap();

    let mut body = Vec::new();
    if !head {
        match BodyLength::of(&headers) {
            BodyLength::None if header::is_connection_close(&headers) => {
                transfer::copy_to_eof(client, &mut body).await.unwrap();
            }
            length => transfer::copy_body(client, &mut body, length).await.unwrap(),
        }
    }

    TestResponse {
        status,
        headers,
        body,
    }
}

/// True once the proxy has closed its side.
pub async fn is_closed(client: &mut Client) -> bool {
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        parser::read_line(client),
    )
    .await
    .expect("proxy neither closed nor answered");

    matches!(result, Ok(LineRead::Eof) | Err(_))
}

/// What a scripted backend sends back for one request.
pub struct Reply {
    pub bytes: Vec<u8>,
    /// Close the backend connection after sending
    pub close: bool,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self {
            bytes: format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .into_bytes(),
            close: false,
        }
    }

    pub fn raw(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            close: false,
        }
    }

    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub request: Request,
    pub body: Vec<u8>,
}

/// A loopback HTTP server answering each request with a scripted reply.
pub struct Backend {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Backend {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&Request, &[u8]) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);

        let backend = Backend {
            addr,
            accepted: accepted.clone(),
            requests: requests.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let respond = respond.clone();
                let requests = requests.clone();

                tokio::spawn(async move {
                    let mut stream = BufReader::new(socket);

                    while let Ok(Some(request)) = parser::read_request(&mut stream).await {
                        let mut body = Vec::new();
                        let length = BodyLength::of(&request.headers);
                        if transfer::copy_body(&mut stream, &mut body, length)
                            .await
                            .is_err()
                        {
                            return;
                        }

                        let reply = respond(&request, &body);
                        requests.lock().unwrap().push(Recorded { request, body });

                        if stream.write_all(&reply.bytes).await.is_err() {
                            return;
                        }
                        let _ = stream.flush().await;

                        if reply.close {
                            let _ = stream.shutdown().await;
                            return;
                        }
                    }
                });
            }
        });

        backend
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
