//! Miner-to-pool relay with live destination switching.
//!
//! The relay holds one connection to the active pool ([`PoolLink`]) and
//! bridges every accepted miner connection onto it. The link is already
//! subscribed and authorized as the destination's user, so a miner's own
//! `mining.subscribe` and `mining.authorize` are answered locally. Other
//! miner frames go to the pool as they are, except `mining.submit`, whose
//! worker name becomes the destination's user before the share is checked
//! by that user's validator. Pool frames are broadcast back to every miner.
//!
//! ## Switching
//!
//! [`Relay::switch_destination`] dials a new pool and swaps it in
//! atomically, then arms a timer that reverts to the previous pool after the
//! configured window. Switching again while a revert is pending restarts the
//! timer, but the revert still targets the pool that was active before the
//! first switch.
//!
//! The active link is published through a `watch` channel, so sessions pick
//! up a new pool on their next frame. Subscribed miners are sent the new
//! pool's extranonce, difficulty and job. Switch, revert and reconnect all
//! take the same async lock, so they never race each other.

mod destination;
mod history;
mod pool;
#[cfg(test)]
mod test_pool;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::stratum_v1::{
    error_line, response_line, rewrite_submit_worker, FrameReader, FramingMode, Message,
    SubmitParams, DEFAULT_MAX_FRAME_SIZE, MINING_AUTHORIZE, MINING_SUBMIT, MINING_SUBSCRIBE,
};
use crate::tcp_server::ConnectionHandler;
use crate::tracing::prelude::*;
use crate::validator::ShareValidators;

pub use destination::Destination;
pub use history::{ChangeReason, DestinationHistory, HistoryEntry};
pub use pool::PoolLink;

/// How long to wait between attempts to reach the original pool when a
/// revert fails.
const REVERT_RETRY: Duration = Duration::from_secs(5);

const LOCAL_REPLY_BACKLOG: usize = 16;

/// Tunables for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// How long a switched-to destination stays active before reverting.
    pub revert_window: Duration,
    pub dial_timeout: Duration,
    /// Miners silent for this long are disconnected.
    pub idle_read_timeout: Duration,
    pub max_frame_size: usize,
    pub framing: FramingMode,
    /// Number of destination changes to remember.
    pub history_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            revert_window: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(10),
            idle_read_timeout: Duration::from_secs(10 * 60),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            framing: FramingMode::Line,
            history_capacity: 64,
        }
    }
}

/// Shared handle to the relay. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

struct Inner {
    config: RelayConfig,
    route: watch::Sender<Arc<PoolLink>>,
    control: tokio::sync::Mutex<Control>,
    history: parking_lot::Mutex<DestinationHistory>,
    validators: parking_lot::RwLock<Option<ShareValidators>>,
    shutdown: CancellationToken,
}

/// State guarded by the control lock.
#[derive(Default)]
struct Control {
    pending_revert: Option<PendingRevert>,
}

struct PendingRevert {
    original: Destination,
    cancel: CancellationToken,
}

/// Miner requests the relay answers itself, keyed by request id.
#[derive(Debug)]
enum LocalReply {
    Subscribe(serde_json::Value),
    Authorize(serde_json::Value),
}

#[derive(Debug, Default)]
struct UpstreamStats {
    frames: u64,
    shares_accepted: u64,
    shares_rejected: u64,
}

impl Relay {
    /// Connect to the default pool.
    ///
    /// Pending revert timers stop when `shutdown` is cancelled.
    pub async fn connect(
        destination: Destination,
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let link = PoolLink::connect(destination.clone(), &config).await?;
        info!(dest = %destination, "Relaying to pool");

        let mut history = DestinationHistory::new(config.history_capacity);
        history.record(destination, ChangeReason::Initial);
        let (route, _) = watch::channel(link);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                route,
                control: tokio::sync::Mutex::new(Control::default()),
                history: parking_lot::Mutex::new(history),
                validators: parking_lot::RwLock::new(None),
                shutdown,
            }),
        })
    }

    /// Route submitted shares to `validators`.
    pub fn attach_validators(&self, validators: ShareValidators) {
        *self.inner.validators.write() = Some(validators);
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn current_destination(&self) -> Destination {
        self.inner.route.borrow().destination().clone()
    }

    /// Destination a pending revert will restore, if one is armed.
    pub async fn pending_revert(&self) -> Option<Destination> {
        let control = self.inner.control.lock().await;
        control.pending_revert.as_ref().map(|p| p.original.clone())
    }

    /// Destination changes, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// Send hashrate to `destination` until the revert window elapses.
    ///
    /// On dial failure the relay stays where it was and no revert is armed
    /// or disturbed.
    pub async fn switch_destination(&self, destination: Destination) -> Result<()> {
        let mut control = self.inner.control.lock().await;

        let link = PoolLink::connect(destination.clone(), &self.inner.config).await?;
        let previous = self.install(link, ChangeReason::Switch);

        let original = match control.pending_revert.take() {
            Some(pending) => {
                pending.cancel.cancel();
                pending.original
            }
            None => previous.destination().clone(),
        };
        info!(
            from = %previous.destination(),
            to = %destination,
            revert_to = %original,
            window = ?self.inner.config.revert_window,
            "Switched destination"
        );

        let cancel = self.inner.shutdown.child_token();
        control.pending_revert = Some(PendingRevert {
            original: original.clone(),
            cancel: cancel.clone(),
        });

        let relay = self.clone();
        let window = self.inner.config.revert_window;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(window) => {}
            }
            relay.revert(original, cancel).await;
        });

        Ok(())
    }

    async fn revert(&self, original: Destination, cancel: CancellationToken) {
        loop {
            {
                let mut control = self.inner.control.lock().await;
                // Superseded by a later switch while waiting for the lock.
                if cancel.is_cancelled() {
                    return;
                }
                match PoolLink::connect(original.clone(), &self.inner.config).await {
                    Ok(link) => {
                        let previous = self.install(link, ChangeReason::Revert);
                        control.pending_revert = None;
                        info!(
                            from = %previous.destination(),
                            to = %original,
                            "Reverted destination"
                        );
                        return;
                    }
                    Err(e) => {
                        warn!(dest = %original, error = %e, "Revert failed, will retry")
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(REVERT_RETRY) => {}
            }
        }
    }

    /// Publish `link` as the active pool. Returns the link it replaced.
    fn install(&self, link: Arc<PoolLink>, reason: ChangeReason) -> Arc<PoolLink> {
        let destination = link.destination().clone();
        let previous = self.inner.route.send_replace(link);
        self.inner.history.lock().record(destination, reason);
        previous
    }

    /// The active pool link, redialled if it has failed.
    async fn pool_link(&self) -> Result<Arc<PoolLink>> {
        let link = self.inner.route.borrow().clone();
        if !link.is_closed() {
            return Ok(link);
        }

        let _control = self.inner.control.lock().await;
        let link = self.inner.route.borrow().clone();
        if !link.is_closed() {
            return Ok(link);
        }

        let destination = link.destination().clone();
        warn!(dest = %destination, "Pool connection lost, reconnecting");
        let fresh = PoolLink::connect(destination, &self.inner.config).await?;
        self.install(fresh.clone(), ChangeReason::Reconnect);
        Ok(fresh)
    }

    fn validators(&self) -> Option<ShareValidators> {
        self.inner.validators.read().clone()
    }

    /// Bridge one miner connection until either side closes.
    pub async fn run_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let session = token.child_token();
        info!(peer = %peer, dest = %self.current_destination(), "Miner connected");

        let mut upstream = UpstreamStats::default();
        let mut downstream = 0u64;
        let (replies_tx, replies_rx) = mpsc::channel(LOCAL_REPLY_BACKLOG);
        let (up, down) = tokio::join!(
            async {
                let r = self
                    .miner_to_pool(read_half, replies_tx, peer, &session, &mut upstream)
                    .await;
                session.cancel();
                r
            },
            async {
                let r = self
                    .pool_to_miner(write_half, replies_rx, peer, &session, &mut downstream)
                    .await;
                session.cancel();
                r
            },
        );

        info!(
            peer = %peer,
            frames_to_pool = upstream.frames,
            frames_to_miner = downstream,
            shares_accepted = upstream.shares_accepted,
            shares_rejected = upstream.shares_rejected,
            "Miner disconnected"
        );
        up.and(down)
    }

    async fn miner_to_pool(
        &self,
        read_half: OwnedReadHalf,
        replies: mpsc::Sender<LocalReply>,
        peer: SocketAddr,
        session: &CancellationToken,
        stats: &mut UpstreamStats,
    ) -> Result<()> {
        let config = &self.inner.config;
        let idle = config.idle_read_timeout;
        let mut reader = FrameReader::new(read_half, config.framing, config.max_frame_size);

        loop {
            let frame = tokio::select! {
                _ = session.cancelled() => return Ok(()),
                frame = timeout(idle, reader.next_frame()) => frame,
            };
            let frame = match frame {
                Err(_) => {
                    info!(peer = %peer, timeout = ?idle, "Miner idle, closing");
                    return Ok(());
                }
                Ok(Err(e)) if e.is_eof() => return Ok(()),
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "Bad frame from miner");
                    return Err(e.into());
                }
                Ok(Ok(frame)) => frame,
            };

            let message = Message::from_frame(&frame).ok();
            let local = match &message {
                Some(m) if m.is_method(MINING_SUBSCRIBE) => {
                    debug!(peer = %peer, "Miner subscribed");
                    Some(LocalReply::Subscribe(m.id.clone()))
                }
                Some(m) if m.is_method(MINING_AUTHORIZE) => {
                    let worker = m.params.get(0).and_then(|w| w.as_str()).unwrap_or_default();
                    info!(peer = %peer, worker, "Miner authorized");
                    Some(LocalReply::Authorize(m.id.clone()))
                }
                _ => None,
            };
            if let Some(reply) = local {
                tokio::select! {
                    _ = session.cancelled() => return Ok(()),
                    sent = replies.send(reply) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
                continue;
            }

            let link = tokio::select! {
                _ = session.cancelled() => return Ok(()),
                link = self.pool_link() => link?,
            };
            let frame = match &message {
                Some(m) if m.is_method(MINING_SUBMIT) => {
                    self.prepare_submit(frame, m, &link, peer, stats)
                }
                _ => frame,
            };

            if let Err(e) = link.send(&frame).await {
                warn!(peer = %peer, error = %e, "Forwarding to pool failed");
                return Err(e);
            }
            stats.frames += 1;
        }
    }

    /// Credit a submitted share to the account of the pool it is sent to.
    ///
    /// The worker name is replaced with the destination's pool user, which
    /// is also the name the share is validated under. Returns the frame to
    /// forward.
    fn prepare_submit(
        &self,
        frame: Bytes,
        message: &Message,
        link: &PoolLink,
        peer: SocketAddr,
        stats: &mut UpstreamStats,
    ) -> Bytes {
        let mut submit = match SubmitParams::from_message(message) {
            Ok(Some(submit)) => submit,
            Ok(None) => return frame,
            Err(e) => {
                trace!(peer = %peer, error = %e, "Unparsed submit forwarded as-is");
                return frame;
            }
        };

        let pool_user = link.destination().username();
        let frame = if pool_user.is_empty() || submit.worker_name == pool_user {
            frame
        } else {
            match rewrite_submit_worker(&frame, pool_user) {
                Ok(rewritten) => {
                    trace!(
                        peer = %peer,
                        from = %submit.worker_name,
                        to = pool_user,
                        "Worker rewritten"
                    );
                    submit.worker_name = pool_user.to_string();
                    rewritten
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Cannot rewrite worker, forwarding as-is");
                    frame
                }
            }
        };

        self.validate_share(pool_user, &submit, peer, stats);
        frame
    }

    fn validate_share(
        &self,
        contract: &str,
        submit: &SubmitParams,
        peer: SocketAddr,
        stats: &mut UpstreamStats,
    ) {
        let Some(validators) = self.validators() else {
            return;
        };
        match validators.submit(contract, submit) {
            None => trace!(peer = %peer, contract, "No validator for destination"),
            Some(Ok(outcome)) if outcome.accepted => {
                stats.shares_accepted += 1;
                debug!(peer = %peer, contract, hash = %outcome.hash, "Share accepted");
            }
            Some(Ok(outcome)) => {
                stats.shares_rejected += 1;
                debug!(peer = %peer, contract, hash = %outcome.hash, "Share above target");
            }
            Some(Err(e)) => {
                stats.shares_rejected += 1;
                warn!(peer = %peer, contract, error = %e, "Share not counted");
            }
        }
    }

    async fn pool_to_miner(
        &self,
        mut write_half: OwnedWriteHalf,
        mut replies: mpsc::Receiver<LocalReply>,
        peer: SocketAddr,
        session: &CancellationToken,
        forwarded: &mut u64,
    ) -> Result<()> {
        let mut route = self.inner.route.subscribe();
        let mut link = route.borrow_and_update().clone();
        let mut frames = link.subscribe();
        let mut live = true;
        let mut subscribed = false;

        loop {
            let frame = tokio::select! {
                biased;
                _ = session.cancelled() => return Ok(()),
                changed = route.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    link = route.borrow_and_update().clone();
                    let stale = std::mem::replace(&mut frames, link.subscribe());
                    live = true;
                    // Hand over whatever the old pool already sent.
                    let mut pending = drain(stale);
                    if subscribed {
                        pending.extend(link.resync_frames(true));
                        debug!(peer = %peer, dest = %link.destination(), "Resyncing miner");
                    }
                    for frame in pending {
                        write_frame(&mut write_half, &frame, session).await?;
                        *forwarded += 1;
                    }
                    continue;
                }
                reply = replies.recv() => {
                    let Some(reply) = reply else {
                        return Ok(());
                    };
                    for frame in local_reply(reply, &link, &mut subscribed) {
                        write_frame(&mut write_half, &frame, session).await?;
                        *forwarded += 1;
                    }
                    continue;
                }
                frame = frames.recv(), if live => frame,
            };

            match frame {
                Ok(frame) => {
                    write_frame(&mut write_half, &frame, session).await?;
                    *forwarded += 1;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(peer = %peer, skipped, "Miner fell behind pool, frames dropped");
                }
                // The link is gone; wait for the relay to publish another.
                Err(broadcast::error::RecvError::Closed) => live = false,
            }
        }
    }
}

/// Frames answering a miner request on behalf of `link`'s pool.
///
/// A subscribe is answered with the pool's extranonce, followed by its
/// current difficulty and job.
fn local_reply(reply: LocalReply, link: &PoolLink, subscribed: &mut bool) -> Vec<Bytes> {
    match reply {
        LocalReply::Subscribe(id) => match link.extranonce() {
            Some(extranonce) => {
                *subscribed = true;
                let result = response_line(&id, extranonce.subscribe_result());
                let mut frames = vec![Bytes::from(result)];
                frames.extend(link.resync_frames(false));
                frames
            }
            None => vec![Bytes::from(error_line(&id, 20, "pool assigned no extranonce"))],
        },
        LocalReply::Authorize(id) => {
            vec![Bytes::from(response_line(&id, serde_json::Value::Bool(true)))]
        }
    }
}

fn drain(mut frames: broadcast::Receiver<Bytes>) -> Vec<Bytes> {
    let mut pending = Vec::new();
    loop {
        match frames.try_recv() {
            Ok(frame) => pending.push(frame),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return pending,
        }
    }
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    session: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = session.cancelled() => Ok(()),
        written = writer.write_all(frame) => Ok(written?),
    }
}

#[async_trait]
impl ConnectionHandler for Relay {
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<()> {
        self.run_session(stream, peer, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::test_pool::{MockPool, DIFFICULTY, NOTIFY};
    use super::*;
    use crate::error::Error;
    use crate::stratum_v1::{Extranonce, FrameError, MINING_SET_EXTRANONCE};
    use crate::validator::{BlockTemplateUpdate, NewValidatorRequest};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const STEP: Duration = Duration::from_secs(5);

    fn config(revert_window: Duration) -> RelayConfig {
        RelayConfig {
            revert_window,
            dial_timeout: Duration::from_secs(2),
            ..RelayConfig::default()
        }
    }

    async fn relay_on(pool: &MockPool, config: RelayConfig) -> Relay {
        let dest = pool.destination("seller.w1", "x");
        Relay::connect(dest, config, CancellationToken::new())
            .await
            .unwrap()
    }

    async fn read_line<S: tokio::io::AsyncBufRead + Unpin>(conn: &mut S) -> String {
        let mut line = String::new();
        timeout(STEP, conn.read_line(&mut line)).await.unwrap().unwrap();
        line
    }

    async fn miner(relay: &Relay) -> (BufReader<TcpStream>, JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let miner = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let relay = relay.clone();
        let session = tokio::spawn(async move {
            relay
                .handle_connection(stream, peer, CancellationToken::new())
                .await
        });
        (BufReader::new(miner), session)
    }

    async fn send(miner: &mut BufReader<TcpStream>, frame: &str) {
        miner.get_mut().write_all(frame.as_bytes()).await.unwrap();
    }

    /// Subscribe and authorize as a miner would, checking the local replies.
    async fn handshake(miner: &mut BufReader<TcpStream>, pool_extranonce: &Extranonce) {
        let subscribe = r#"{"id":1,"method":"mining.subscribe","params":["cgminer"]}"#;
        send(miner, &format!("{subscribe}\n")).await;
        let subscribed = Message::from_frame(read_line(miner).await.as_bytes()).unwrap();
        assert!(subscribed.is_response_to(1));
        assert_eq!(
            Extranonce::from_subscribe_result(&subscribed.result).as_ref(),
            Some(pool_extranonce)
        );
        assert_eq!(read_line(miner).await, DIFFICULTY);
        assert_eq!(read_line(miner).await, NOTIFY);

        let authorize = r#"{"id":2,"method":"mining.authorize","params":["seller.w1","x"]}"#;
        send(miner, &format!("{authorize}\n")).await;
        let authorized = Message::from_frame(read_line(miner).await.as_bytes()).unwrap();
        assert!(authorized.is_response_to(2));
        assert_eq!(authorized.result, json!(true));
    }

    async fn wait_for(relay: &Relay, dest: &Destination) {
        timeout(STEP, async {
            while relay.current_destination() != *dest {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Bitcoin's genesis header with the nonce left out.
    fn genesis() -> BlockTemplateUpdate {
        BlockTemplateUpdate {
            version: "00000001".into(),
            previous_block_hash: "0000000000000000000000000000000000000000000000000000000000000000"
                .into(),
            merkle_root: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                .into(),
            time: "495fab29".into(),
            bits: "1d00ffff".into(),
        }
    }

    fn genesis_submit(worker: &str) -> String {
        SubmitParams {
            worker_name: worker.into(),
            job_id: "1".into(),
            extranonce2: "0000000000000000".into(),
            ntime: "0x495fab29".into(),
            nonce: "0x7c2bac1d".into(),
        }
        .to_request_line(4)
    }

    #[tokio::test]
    async fn frames_cross_in_both_directions() {
        let mut pool = MockPool::start().await;
        let relay = relay_on(&pool, config(Duration::from_secs(60))).await;
        let mut upstream = pool.next().await;
        let (mut miner, session) = miner(&relay).await;

        let request = "{\"id\":3,\"method\":\"mining.extranonce.subscribe\",\"params\":[]}\n";
        send(&mut miner, request).await;
        assert_eq!(upstream.read_line().await, request);

        upstream.send(b"{\"id\":3,\"result\":true}\n").await;
        assert_eq!(read_line(&mut miner).await, "{\"id\":3,\"result\":true}\n");

        drop(miner);
        timeout(STEP, session).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn miner_handshake_is_answered_locally() {
        let mut pool = MockPool::start().await;
        let relay = relay_on(&pool, config(Duration::from_secs(60))).await;
        let mut upstream = pool.next().await;
        assert_eq!(upstream.user, "seller.w1");
        let (mut miner, _session) = miner(&relay).await;

        handshake(&mut miner, &MockPool::extranonce()).await;
        assert_eq!(upstream.try_read_line(Duration::from_millis(200)).await, None);
    }

    #[tokio::test]
    async fn switched_shares_are_credited_to_the_buyer() {
        let mut pool_a = MockPool::start().await;
        let mut pool_b = MockPool::start().await;
        let relay = relay_on(&pool_a, config(Duration::from_secs(60))).await;
        let _seller = pool_a.next().await;

        let (validators, _events) = ShareValidators::new();
        validators
            .create(&NewValidatorRequest {
                template: genesis(),
                difficulty: None,
                hash_rate: 1_000_000,
                limit: 0,
                pool_user: "buyer.acct".into(),
            })
            .unwrap();
        relay.attach_validators(validators.clone());

        let (mut miner, _session) = miner(&relay).await;
        handshake(&mut miner, &MockPool::extranonce()).await;

        let buyer = pool_b.destination("buyer.acct", "secret");
        relay.switch_destination(buyer).await.unwrap();
        let mut upstream_b = pool_b.next().await;
        assert_eq!(upstream_b.user, "buyer.acct");
        assert_eq!(upstream_b.password, "secret");

        let resync = Message::from_frame(read_line(&mut miner).await.as_bytes()).unwrap();
        assert!(resync.is_method(MINING_SET_EXTRANONCE));
        assert_eq!(read_line(&mut miner).await, DIFFICULTY);
        assert_eq!(read_line(&mut miner).await, NOTIFY);

        send(&mut miner, &genesis_submit("seller.w1")).await;
        let forwarded = upstream_b.read_line().await;
        let forwarded = SubmitParams::from_frame(forwarded.as_bytes()).unwrap().unwrap();
        assert_eq!(forwarded.worker_name, "buyer.acct");
        assert_eq!(forwarded.nonce, "0x7c2bac1d");

        let snapshot = validators.snapshot("buyer.acct").unwrap();
        assert_eq!(snapshot.hashes_analyzed, 1);
    }

    #[tokio::test]
    async fn switch_routes_to_new_pool_then_reverts() {
        let mut pool_a = MockPool::start().await;
        let mut pool_b = MockPool::start().await;
        let dest_a = pool_a.destination("seller.w1", "x");
        let dest_b = pool_b.destination("w2", "x");
        let relay = relay_on(&pool_a, config(Duration::from_millis(300))).await;
        let _first_a = pool_a.next().await;
        let (mut miner, _session) = miner(&relay).await;

        relay.switch_destination(dest_b.clone()).await.unwrap();
        assert_eq!(relay.current_destination(), dest_b);
        assert_eq!(relay.pending_revert().await, Some(dest_a.clone()));

        let mut upstream_b = pool_b.next().await;
        send(&mut miner, "{\"id\":2}\n").await;
        assert_eq!(upstream_b.read_line().await, "{\"id\":2}\n");

        upstream_b.send(b"{\"id\":2,\"result\":true}\n").await;
        assert_eq!(read_line(&mut miner).await, "{\"id\":2,\"result\":true}\n");

        let mut upstream_a = pool_a.next().await;
        wait_for(&relay, &dest_a).await;
        assert_eq!(relay.pending_revert().await, None);

        send(&mut miner, "{\"id\":3}\n").await;
        assert_eq!(upstream_a.read_line().await, "{\"id\":3}\n");
    }

    #[tokio::test]
    async fn overlapping_switches_revert_to_the_original() {
        let mut pool_a = MockPool::start().await;
        let mut pool_b = MockPool::start().await;
        let mut pool_c = MockPool::start().await;
        let dest_a = pool_a.destination("seller.w1", "x");
        let dest_c = pool_c.destination("w3", "x");
        let relay = relay_on(&pool_a, config(Duration::from_millis(300))).await;
        let _a = pool_a.next().await;

        relay
            .switch_destination(pool_b.destination("w2", "x"))
            .await
            .unwrap();
        let _b = pool_b.next().await;
        relay.switch_destination(dest_c.clone()).await.unwrap();
        let _c = pool_c.next().await;

        assert_eq!(relay.current_destination(), dest_c);
        assert_eq!(relay.pending_revert().await, Some(dest_a.clone()));

        let _a_again = pool_a.next().await;
        wait_for(&relay, &dest_a).await;

        let reasons: Vec<_> = relay.history().iter().map(|e| e.reason).collect();
        assert_eq!(
            reasons,
            [
                ChangeReason::Initial,
                ChangeReason::Switch,
                ChangeReason::Switch,
                ChangeReason::Revert
            ]
        );
    }

    #[tokio::test]
    async fn failed_switch_leaves_relay_in_place() {
        let mut pool_a = MockPool::start().await;
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_dead = Destination::new(dead.local_addr().unwrap().to_string(), "w2", "x");
        drop(dead);

        let relay = relay_on(&pool_a, config(Duration::from_secs(60))).await;
        let dest_a = relay.current_destination();
        let _a = pool_a.next().await;

        let err = relay.switch_destination(dest_dead).await.unwrap_err();
        assert!(matches!(err, Error::Pool(_)));
        assert_eq!(relay.current_destination(), dest_a);
        assert_eq!(relay.pending_revert().await, None);
        assert_eq!(relay.history().len(), 1);
    }

    #[tokio::test]
    async fn refused_authorization_fails_the_switch() {
        let mut pool_a = MockPool::start().await;
        let refusing = MockPool::refusing().await;
        let relay = relay_on(&pool_a, config(Duration::from_secs(60))).await;
        let dest_a = relay.current_destination();
        let _a = pool_a.next().await;

        let err = relay
            .switch_destination(refusing.destination("buyer.acct", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pool(msg) if msg.contains("refused authorization")));
        assert_eq!(relay.current_destination(), dest_a);
        assert_eq!(relay.pending_revert().await, None);
    }

    #[tokio::test]
    async fn lost_pool_is_redialled_on_next_frame() {
        let mut pool = MockPool::start().await;
        let relay = relay_on(&pool, config(Duration::from_secs(60))).await;
        let first = pool.next().await;
        let (mut miner, _session) = miner(&relay).await;

        drop(first);
        let link = relay.inner.route.borrow().clone();
        timeout(STEP, link.closed()).await.unwrap();
        drop(link);

        send(&mut miner, "{\"id\":4}\n").await;
        let mut second = pool.next().await;
        assert_eq!(second.read_line().await, "{\"id\":4}\n");
        assert_eq!(
            relay.history().last().map(|e| e.reason),
            Some(ChangeReason::Reconnect)
        );
    }

    #[tokio::test]
    async fn silent_miner_is_dropped_after_idle_timeout() {
        let mut pool = MockPool::start().await;
        let config = RelayConfig {
            idle_read_timeout: Duration::from_secs(30),
            ..config(Duration::from_secs(60))
        };
        let relay = relay_on(&pool, config).await;
        let _upstream = pool.next().await;
        let (mut miner, session) = miner(&relay).await;

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!session.is_finished());

        tokio::time::advance(Duration::from_secs(2)).await;
        session.await.unwrap().unwrap();
        let mut rest = String::new();
        assert_eq!(miner.read_line(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_frame_ends_session_without_reaching_pool() {
        let mut pool = MockPool::start().await;
        let config = RelayConfig {
            max_frame_size: 256,
            ..config(Duration::from_secs(60))
        };
        let relay = relay_on(&pool, config).await;
        let mut upstream = pool.next().await;
        let (mut miner, session) = miner(&relay).await;

        send(&mut miner, &"a".repeat(300)).await;
        let err = timeout(STEP, session).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Frame(FrameError::TooLarge { limit: 256 })
        ));
        assert_eq!(upstream.try_read_line(Duration::from_millis(200)).await, None);
    }

    #[tokio::test]
    async fn cancelling_the_session_ends_it() {
        let mut pool = MockPool::start().await;
        let relay = relay_on(&pool, config(Duration::from_secs(60))).await;
        let _a = pool.next().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _miner = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let token = CancellationToken::new();
        let session = tokio::spawn({
            let relay = relay.clone();
            let token = token.clone();
            async move { relay.run_session(stream, peer, token).await }
        });

        token.cancel();
        timeout(STEP, session).await.unwrap().unwrap().unwrap();
    }
}
