//! Shared helpers for integration tests.
//!
//! Instead of a live server the tests talk to [`MockNode`]: a tokio
//! `TcpListener` that decodes requests with the crate's own `Decoder` and
//! answers each one according to a handler closure. Each connection is
//! served strictly in order, like a real Redis node.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use rsedis::resp::{encode_reply, Decoder};
use rsedis::{NodeDescriptor, Reply};

/// What the mock does with one request.
pub enum Action {
    Reply(Reply),
    /// Write these bytes verbatim.
    Raw(Vec<u8>),
    /// Wait, then perform the inner action.
    After(Duration, Box<Action>),
    /// Hang up without answering.
    Close,
    /// Never answer.
    Silent,
}

pub fn ok() -> Action {
    Action::Reply(Reply::Status("OK".into()))
}

pub fn bulk(s: impl Into<String>) -> Action {
    Action::Reply(Reply::bulk(s.into()))
}

pub fn error(s: impl Into<String>) -> Action {
    Action::Reply(Reply::Error(s.into()))
}

type Handler = Arc<dyn Fn(&[String]) -> Action + Send + Sync>;

/// An in-process scripted Redis node.
pub struct MockNode {
    pub port: u16,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    connections: Arc<AtomicUsize>,
}

impl MockNode {
    /// Bind an ephemeral port and start serving.
    pub async fn start(handler: impl Fn(&[String]) -> Action + Send + Sync + 'static) -> Self {
        Self::serve(bind().await, handler)
    }

    /// Serve on a listener bound earlier, so its port can be handed to
    /// another node's handler first.
    pub fn serve(
        listener: TcpListener,
        handler: impl Fn(&[String]) -> Action + Send + Sync + 'static,
    ) -> Self {
        let port = listener.local_addr().unwrap().port();
        let handler: Handler = Arc::new(handler);
        let log = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let (log2, conns2) = (log.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                conns2.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(socket, handler.clone(), log2.clone()));
            }
        });

        Self {
            port,
            log,
            connections,
        }
    }

    pub fn node(&self) -> NodeDescriptor {
        NodeDescriptor::new("127.0.0.1", self.port)
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Every request received so far, in arrival order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.log.lock().clone()
    }

    /// Command names received so far, in arrival order.
    pub fn names(&self) -> Vec<String> {
        self.log.lock().iter().map(|c| c[0].clone()).collect()
    }

    /// How many requests named `name` arrived.
    pub fn count(&self, name: &str) -> usize {
        self.log.lock().iter().filter(|c| c[0] == name).count()
    }

    /// How many TCP connections were accepted.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    mut socket: tokio::net::TcpStream,
    handler: Handler,
    log: Arc<Mutex<Vec<Vec<String>>>>,
) {
    let mut decoder = Decoder::new();
    let mut buf = BytesMut::new();
    loop {
        while let Ok(Some(req)) = decoder.decode(&mut buf) {
            let args: Vec<String> = req
                .into_array()
                .unwrap_or_default()
                .iter()
                .map(|a| String::from_utf8_lossy(a.as_bytes().unwrap_or_default()).into_owned())
                .collect();
            log.lock().push(args.clone());

            let mut action = handler(&args);
            loop {
                match action {
                    Action::After(delay, inner) => {
                        tokio::time::sleep(delay).await;
                        action = *inner;
                    }
                    Action::Reply(reply) => {
                        let mut out = Vec::new();
                        encode_reply(&reply, &mut out);
                        if socket.write_all(&out).await.is_err() {
                            return;
                        }
                        break;
                    }
                    Action::Raw(bytes) => {
                        if socket.write_all(&bytes).await.is_err() {
                            return;
                        }
                        break;
                    }
                    Action::Close => return,
                    Action::Silent => break,
                }
            }
        }
        match socket.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

pub async fn bind() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

pub fn port_of(listener: &TcpListener) -> u16 {
    listener.local_addr().unwrap().port()
}

/// A `CLUSTER SLOTS` reply assigning `(start, end, port)` ranges to
/// masters on 127.0.0.1.
pub fn cluster_slots(ranges: &[(u16, u16, u16)]) -> Reply {
    Reply::array(
        ranges
            .iter()
            .map(|&(start, end, port)| {
                Reply::array(vec![
                    Reply::Integer(start as i64),
                    Reply::Integer(end as i64),
                    Reply::array(vec![
                        Reply::bulk("127.0.0.1"),
                        Reply::Integer(port as i64),
                        Reply::bulk(format!("node-{port}")),
                    ]),
                ])
            })
            .collect(),
    )
}

/// Route `tracing` output to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
