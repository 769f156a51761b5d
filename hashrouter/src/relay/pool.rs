//! Connection to an upstream pool, shared by every miner session.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{Destination, RelayConfig};
use crate::error::{Error, Result};
use crate::stratum_v1::{
    Extranonce, FrameReader, Message, Request, MINING_NOTIFY, MINING_SET_DIFFICULTY,
    MINING_SET_EXTRANONCE,
};
use crate::tracing::prelude::*;

const FRAME_BACKLOG: usize = 256;

const USER_AGENT: &str = "hashrouter";
const SUBSCRIBE_ID: u64 = 1;
const AUTHORIZE_ID: u64 = 2;

/// What a miner needs to work on this pool: its extranonce plus the most
/// recent difficulty and job.
#[derive(Debug, Default)]
struct Work {
    extranonce: Option<Extranonce>,
    difficulty: Option<Bytes>,
    notify: Option<Bytes>,
}

impl Work {
    /// Remember `frame` if it changes the work. Returns whether it did.
    fn observe(&mut self, frame: &Bytes) -> bool {
        let Ok(message) = Message::from_frame(frame) else {
            return false;
        };
        match message.method.as_deref() {
            Some(MINING_SET_DIFFICULTY) => self.difficulty = Some(frame.clone()),
            Some(MINING_NOTIFY) => self.notify = Some(frame.clone()),
            Some(MINING_SET_EXTRANONCE) => {
                // Same layout as a subscribe result minus the subscriptions.
                let mut result = vec![serde_json::Value::Null];
                if let Some(params) = message.params.as_array() {
                    result.extend(params.iter().cloned());
                }
                let result = serde_json::Value::Array(result);
                if let Some(extranonce) = Extranonce::from_subscribe_result(&result) {
                    self.extranonce = Some(extranonce);
                }
            }
            _ => return false,
        }
        true
    }
}

/// One subscribed and authorized TCP connection to a pool.
///
/// Writes from all sessions go through a single lock so frames never
/// interleave. Frames read from the pool are broadcast to every subscribed
/// session. The link marks itself closed when either direction fails; it
/// is never reopened, the relay dials a fresh one instead.
#[derive(Debug)]
pub struct PoolLink {
    destination: Destination,
    writer: Mutex<OwnedWriteHalf>,
    frames: broadcast::Sender<Bytes>,
    work: Arc<SyncMutex<Work>>,
    closed: CancellationToken,
}

impl PoolLink {
    /// Dial `destination`, subscribe, and authorize as its user.
    ///
    /// Dialing and the handshake together are bounded by the dial timeout.
    /// A refused subscribe or authorize is an [`Error::Pool`], as is a
    /// subscribe result without an extranonce.
    pub async fn connect(destination: Destination, config: &RelayConfig) -> Result<Arc<Self>> {
        let dial = async {
            let stream = TcpStream::connect(destination.address())
                .await
                .map_err(|e| Error::Pool(format!("cannot dial {destination}: {e}")))?;
            stream.set_nodelay(true)?;
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half, config.framing, config.max_frame_size);
            let work = handshake(&destination, &mut reader, &mut write_half).await?;
            Ok::<_, Error>((reader, write_half, work))
        };
        let (reader, writer, work) = timeout(config.dial_timeout, dial)
            .await
            .map_err(|_| Error::Pool(format!("timed out connecting to {destination}")))??;
        debug!(dest = %destination, "Authorized with pool");

        let (frames, _) = broadcast::channel(FRAME_BACKLOG);
        let link = Arc::new(Self {
            destination,
            writer: Mutex::new(writer),
            frames,
            work: Arc::new(SyncMutex::new(work)),
            closed: CancellationToken::new(),
        });
        link.spawn_reader(reader);
        Ok(link)
    }

    fn spawn_reader(&self, mut reader: FrameReader<OwnedReadHalf>) {
        let tx = self.frames.clone();
        let work = self.work.clone();
        let closed = self.closed.clone();
        let dest = self.destination.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = reader.next_frame() => frame,
                };
                match frame {
                    Ok(frame) => {
                        trace!(dest = %dest, len = frame.len(), "Frame from pool");
                        work.lock().observe(&frame);
                        // No subscribers just means no miners are connected.
                        let _ = tx.send(frame);
                    }
                    Err(e) if e.is_eof() => {
                        debug!(dest = %dest, "Pool closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(dest = %dest, error = %e, "Pool read failed");
                        break;
                    }
                }
            }
            closed.cancel();
        });
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Extranonce the pool currently assigns to this connection.
    pub fn extranonce(&self) -> Option<Extranonce> {
        self.work.lock().extranonce.clone()
    }

    /// Frames that move a subscribed miner onto this pool's current work:
    /// `mining.set_extranonce` when `with_extranonce` is set, then the
    /// latest difficulty and job.
    pub fn resync_frames(&self, with_extranonce: bool) -> Vec<Bytes> {
        let work = self.work.lock();
        let mut frames = Vec::new();
        if with_extranonce {
            if let Some(extranonce) = &work.extranonce {
                frames.push(Bytes::from(Request::set_extranonce(extranonce).to_line()));
            }
        }
        frames.extend(work.difficulty.iter().cloned());
        frames.extend(work.notify.iter().cloned());
        frames
    }

    /// Write one frame to the pool.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("pool connection"));
        }
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            self.closed.cancel();
            return Err(Error::Pool(format!(
                "write to {} failed: {e}",
                self.destination
            )));
        }
        Ok(())
    }

    /// Receive frames the pool sends from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.frames.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the link has failed or been dropped.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl Drop for PoolLink {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Subscribe, then authorize with the destination's credentials. Work
/// notifications that arrive in between are kept.
async fn handshake(
    destination: &Destination,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> Result<Work> {
    let mut work = Work::default();

    let subscribe = Request::subscribe(SUBSCRIBE_ID, USER_AGENT);
    writer.write_all(subscribe.to_line().as_bytes()).await?;
    let subscribed = await_response(reader, SUBSCRIBE_ID, &mut work).await?;
    if subscribed.is_error() {
        return Err(Error::Pool(format!(
            "{destination} refused subscribe: {}",
            subscribed.error
        )));
    }
    let Some(extranonce) = Extranonce::from_subscribe_result(&subscribed.result) else {
        return Err(Error::Pool(format!(
            "{destination} sent no extranonce: {}",
            subscribed.result
        )));
    };
    work.extranonce = Some(extranonce);

    let authorize = Request::authorize(
        AUTHORIZE_ID,
        destination.username(),
        destination.password(),
    );
    writer.write_all(authorize.to_line().as_bytes()).await?;
    let authorized = await_response(reader, AUTHORIZE_ID, &mut work).await?;
    if authorized.is_error() {
        return Err(Error::Pool(format!(
            "{destination} refused authorization: {}",
            authorized.error
        )));
    }

    Ok(work)
}

async fn await_response(
    reader: &mut FrameReader<OwnedReadHalf>,
    id: u64,
    work: &mut Work,
) -> Result<Message> {
    loop {
        let frame = reader.next_frame().await?;
        if work.observe(&frame) {
            continue;
        }
        match Message::from_frame(&frame) {
            Ok(message) if message.is_response_to(id) => return Ok(message),
            Ok(_) => trace!(len = frame.len(), "Ignoring frame during pool handshake"),
            Err(e) => return Err(Error::Pool(format!("bad frame during handshake: {e}"))),
        }
    }
}
