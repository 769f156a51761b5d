//! Loopback pool for relay tests. Answers the subscribe and authorize
//! handshake, then hands each connection to the test.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::Destination;
use crate::stratum_v1::{
    error_line, response_line, Extranonce, Message, MINING_AUTHORIZE, MINING_SUBSCRIBE,
};

const STEP: Duration = Duration::from_secs(5);

const EXTRANONCE1: &str = "086502001b720a";
const EXTRANONCE2_SIZE: u64 = 8;

/// Sent after subscribe, before the authorize result.
pub(crate) const DIFFICULTY: &str =
    "{\"id\":null,\"method\":\"mining.set_difficulty\",\"params\":[1]}\n";
pub(crate) const NOTIFY: &str = "{\"id\":null,\"method\":\"mining.notify\",\"params\":[\"1\"]}\n";

pub(crate) struct MockPool {
    addr: SocketAddr,
    conns: mpsc::UnboundedReceiver<PoolConn>,
    acceptor: JoinHandle<()>,
}

/// A connection that completed the handshake.
pub(crate) struct PoolConn {
    pub user: String,
    pub password: String,
    stream: BufReader<TcpStream>,
}

impl MockPool {
    pub async fn start() -> Self {
        Self::spawn(true).await
    }

    /// A pool that rejects every authorize.
    pub async fn refusing() -> Self {
        Self::spawn(false).await
    }

    async fn spawn(authorize: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(conn) = handshake(stream, authorize).await {
                        let _ = tx.send(conn);
                    }
                });
            }
        });
        Self {
            addr,
            conns,
            acceptor,
        }
    }

    pub fn extranonce() -> Extranonce {
        Extranonce {
            extranonce1: EXTRANONCE1.into(),
            extranonce2_size: EXTRANONCE2_SIZE,
        }
    }

    pub fn destination(&self, user: &str, password: &str) -> Destination {
        Destination::new(self.addr.to_string(), user, password)
    }

    /// The next authorized connection.
    pub async fn next(&mut self) -> PoolConn {
        timeout(STEP, self.conns.recv())
            .await
            .expect("no connection reached the pool")
            .unwrap()
    }
}

impl Drop for MockPool {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

impl PoolConn {
    pub async fn read_line(&mut self) -> String {
        self.try_read_line(STEP).await.expect("pool read timed out")
    }

    /// Read one line, or `None` if nothing arrives `within`.
    pub async fn try_read_line(&mut self, within: Duration) -> Option<String> {
        let mut line = String::new();
        timeout(within, self.stream.read_line(&mut line))
            .await
            .ok()?
            .unwrap();
        Some(line)
    }

    pub async fn send(&mut self, frame: &[u8]) {
        self.stream.get_mut().write_all(frame).await.unwrap();
    }
}

async fn handshake(stream: TcpStream, authorize: bool) -> Option<PoolConn> {
    let mut stream = BufReader::new(stream);
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let message = Message::from_frame(line.as_bytes()).ok()?;

        if message.is_method(MINING_SUBSCRIBE) {
            let result = json!([
                [["mining.set_difficulty", "1"], ["mining.notify", "1"]],
                EXTRANONCE1,
                EXTRANONCE2_SIZE,
            ]);
            let reply = response_line(&message.id, result);
            stream.get_mut().write_all(reply.as_bytes()).await.ok()?;
        } else if message.is_method(MINING_AUTHORIZE) {
            let param = |i: usize| message.params[i].as_str().unwrap_or_default().to_string();
            let (user, password) = (param(0), param(1));
            if !authorize {
                let reply = error_line(&message.id, 24, "unauthorized worker");
                stream.get_mut().write_all(reply.as_bytes()).await.ok()?;
                return None;
            }
            let reply = response_line(&message.id, json!(true));
            for frame in [DIFFICULTY, NOTIFY, reply.as_str()] {
                stream.get_mut().write_all(frame.as_bytes()).await.ok()?;
            }
            return Some(PoolConn {
                user,
                password,
                stream,
            });
        }
    }
}
