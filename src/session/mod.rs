//! Session engine
//!
//! Four cooperating activities multiplex one byte-stream transport into
//! publish/subscribe flows:
//!
//! - **inbound** decodes packets off the wire and hands them to logic
//! - **outbound** drains the user publish queue and the priority queue,
//!   stamping message identifiers on QoS > 0 traffic
//! - **logic** runs the delivery state machine, synthesizing acks and
//!   completing tokens
//! - **keepalive** times the idle interval, injects PINGREQ and enforces
//!   the PINGRESP deadline
//!
//! All four exit on a single shared stop signal. A fatal transport or
//! decode error is posted to the error queue; logic consumes it, invokes
//! the connection-lost hook exactly once and stops the engine.
//!
//! The write half of the transport is shared between outbound and
//! keepalive through an async mutex, so a ping never queues behind a large
//! publish on the priority queue and the two writers cannot interleave a
//! packet.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, warn};

use crate::buffer_pool::PoolBuf;
use crate::codec::{Decoder, Encoder};
use crate::ids::IdRegistry;
use crate::protocol::{
    ClientError, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe, Unsubscribe,
};
use crate::router::Router;
use crate::token::{DisconnectToken, PendingAck, PublishToken, SubscribeToken, UnsubscribeToken};

/// Inbound read buffer size
const IN_BUF_SIZE: usize = 32 * 1024;

/// Depth of the ibound, obound and priority queues
const QUEUE_DEPTH: usize = 8;

/// Bound on posting a synthesized PUBREL/PUBCOMP to the priority queue.
/// On expiry the ack is dropped; the broker's retransmit recovers the flow.
const ACK_POST_TIMEOUT: Duration = Duration::from_secs(1);

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Options {
    /// Idle interval before the first PINGREQ
    pub keep_alive: Duration,
    /// Idle-before-ping after traffic, and the PINGRESP deadline
    pub ping_timeout: Duration,
    /// Per-write socket deadline, `None` for unbounded writes
    pub write_timeout: Option<Duration>,
    /// Capacity of the queue feeding the router
    pub message_channel_depth: usize,
    /// Ordered (sequential) versus concurrent callback dispatch
    pub ordered: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            write_timeout: None,
            message_channel_depth: 100,
            ordered: true,
        }
    }
}

/// Hook invoked once when the session is lost to an error
pub type ConnectionLostHandler = Arc<dyn Fn(ClientError) + Send + Sync>;

#[derive(Default)]
struct Stats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

/// A user PUBLISH waiting for the writer
struct Obound {
    publish: Publish,
    token: PublishToken,
}

/// Priority traffic: acks, SUBSCRIBE, UNSUBSCRIBE, DISCONNECT
struct OboundP {
    packet: Packet,
    token: Option<PendingAck>,
}

/// Guards the connection-lost hook so it fires at most once, stopping the
/// engine first so every activity observes the stop signal.
struct ConnLost {
    hook: ConnectionLostHandler,
    fired: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl ConnLost {
    fn fire(&self, err: ClientError) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.send(true);
        (self.hook)(err);
    }
}

/// Cheap clonable operation surface of the engine.
///
/// Held by the router's dispatcher so callbacks can publish and subscribe;
/// holding a `Handle` never keeps the engine's activities alive.
#[derive(Clone)]
pub struct Handle {
    obound: mpsc::Sender<Obound>,
    obound_p: mpsc::Sender<OboundP>,
    stats: Arc<Stats>,
    stop: watch::Receiver<bool>,
}

impl Handle {
    /// Whether the engine has been stopped
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Queue a PUBLISH. The returned token completes after the write for
    /// QoS 0, on PUBACK for QoS 1 and on PUBCOMP for QoS 2.
    pub async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) -> PublishToken {
        let token = PublishToken::new();
        if self.is_stopped() {
            token.token().fail(ClientError::Stopped);
            return token;
        }
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: PoolBuf::from(topic),
            message_id: None,
            payload: PoolBuf::copy_from_slice(payload),
        };
        if self
            .obound
            .send(Obound {
                publish,
                token: token.clone(),
            })
            .await
            .is_err()
        {
            token.token().fail(ClientError::Stopped);
        }
        token
    }

    /// Queue a SUBSCRIBE for the given filters. The token completes on
    /// SUBACK with the granted QoS recorded per filter.
    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> SubscribeToken {
        let token = SubscribeToken::new(filters.iter().map(|(f, _)| f.to_string()).collect());
        if self.is_stopped() {
            token.token().fail(ClientError::Stopped);
            return token;
        }
        let packet = Packet::Subscribe(Subscribe {
            message_id: 0,
            topics: filters.iter().map(|(f, q)| (f.to_string(), *q)).collect(),
        });
        if self
            .obound_p
            .send(OboundP {
                packet,
                token: Some(PendingAck::Subscribe(token.clone())),
            })
            .await
            .is_err()
        {
            token.token().fail(ClientError::Stopped);
        }
        token
    }

    /// Queue an UNSUBSCRIBE. The token completes on UNSUBACK.
    pub async fn unsubscribe(&self, filters: &[&str]) -> UnsubscribeToken {
        let token = UnsubscribeToken::new();
        if self.is_stopped() {
            token.fail(ClientError::Stopped);
            return token;
        }
        let packet = Packet::Unsubscribe(Unsubscribe {
            message_id: 0,
            filters: filters.iter().map(|f| f.to_string()).collect(),
        });
        if self
            .obound_p
            .send(OboundP {
                packet,
                token: Some(PendingAck::Unsubscribe(token.clone())),
            })
            .await
            .is_err()
        {
            token.fail(ClientError::Stopped);
        }
        token
    }

    /// Queue a DISCONNECT. The writer completes the token after the write
    /// and exits; no further writes are admitted.
    pub async fn disconnect(&self) -> DisconnectToken {
        let token = DisconnectToken::new();
        if self.is_stopped() {
            token.fail(ClientError::Stopped);
            return token;
        }
        if self
            .obound_p
            .send(OboundP {
                packet: Packet::Disconnect,
                token: Some(PendingAck::Disconnect(token.clone())),
            })
            .await
            .is_err()
        {
            token.fail(ClientError::Stopped);
        }
        token
    }

    /// Monotonic counters: (packets sent, packets received)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.packets_sent.load(Ordering::Relaxed),
            self.stats.packets_received.load(Ordering::Relaxed),
        )
    }
}

/// The session engine. Owns the router and the stop signal; operations are
/// available directly or through [`Engine::handle`].
pub struct Engine {
    handle: Handle,
    router: Arc<Router>,
    stop_tx: watch::Sender<bool>,
}

impl Engine {
    /// Start the engine over an already-negotiated transport. Spawns the
    /// four activities and the router's dispatcher.
    pub fn start<S>(
        stream: S,
        options: Options,
        router: Arc<Router>,
        on_connection_lost: ConnectionLostHandler,
    ) -> Engine
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(wr));

        let (stop_tx, stop_rx) = watch::channel(false);
        let (ibound_tx, ibound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (obound_tx, obound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (obound_p_tx, obound_p_rx) = mpsc::channel(QUEUE_DEPTH);
        let (incoming_tx, incoming_rx) = mpsc::channel(options.message_channel_depth.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(4);
        let (reset_ping_tx, reset_ping_rx) = mpsc::channel(1);
        let (reset_ping_resp_tx, reset_ping_resp_rx) = mpsc::channel(1);

        let ids = Arc::new(IdRegistry::new());
        let stats = Arc::new(Stats::default());
        let conn_lost = Arc::new(ConnLost {
            hook: on_connection_lost,
            fired: AtomicBool::new(false),
            stop_tx: stop_tx.clone(),
        });

        let handle = Handle {
            obound: obound_tx,
            obound_p: obound_p_tx.clone(),
            stats: stats.clone(),
            stop: stop_rx.clone(),
        };

        router.spawn_dispatcher(incoming_rx, handle.clone(), options.ordered, stop_rx.clone());

        tokio::spawn(inbound(
            rd,
            ibound_tx,
            errors_tx.clone(),
            stats.clone(),
            stop_rx.clone(),
        ));
        tokio::spawn(outbound(
            writer.clone(),
            obound_rx,
            obound_p_rx,
            ids.clone(),
            stats,
            errors_tx.clone(),
            reset_ping_tx,
            options.write_timeout,
            stop_rx.clone(),
        ));
        tokio::spawn(logic(
            ibound_rx,
            errors_rx,
            errors_tx,
            obound_p_tx,
            incoming_tx,
            reset_ping_resp_tx,
            ids,
            conn_lost.clone(),
            stop_rx.clone(),
        ));
        tokio::spawn(keepalive(
            writer,
            options.keep_alive,
            options.ping_timeout,
            reset_ping_rx,
            reset_ping_resp_rx,
            conn_lost,
            stop_rx,
        ));

        Engine {
            handle,
            router,
            stop_tx,
        }
    }

    /// The engine's clonable operation surface
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The topic router this engine dispatches through
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Signal every activity to stop. Idempotent; an activity mid-write
    /// may drain one final packet.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: &[u8]) -> PublishToken {
        self.handle.publish(topic, qos, retain, payload).await
    }

    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> SubscribeToken {
        self.handle.subscribe(filters).await
    }

    pub async fn unsubscribe(&self, filters: &[&str]) -> UnsubscribeToken {
        self.handle.unsubscribe(filters).await
    }

    pub async fn disconnect(&self) -> DisconnectToken {
        self.handle.disconnect().await
    }

    /// Monotonic counters: (packets sent, packets received)
    pub fn stats(&self) -> (u64, u64) {
        self.handle.stats()
    }
}

/// Inbound activity: decode packets off the wire, push them to logic.
async fn inbound<S>(
    rd: ReadHalf<S>,
    ibound: mpsc::Sender<Packet>,
    errors: mpsc::Sender<ClientError>,
    stats: Arc<Stats>,
    mut stop: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    debug!("inbound started");
    let mut reader = BufReader::with_capacity(IN_BUF_SIZE, rd);
    let mut buf = BytesMut::with_capacity(IN_BUF_SIZE);
    let decoder = Decoder::new();

    loop {
        match decoder.decode(&buf) {
            Ok(Some((packet, consumed))) => {
                buf.advance(consumed);
                // Bytes can still be buffered after the transport is closed
                // for shutdown; don't hand packets on once stopped.
                if *stop.borrow() {
                    debug!("inbound stopped");
                    return;
                }
                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    sent = ibound.send(packet) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = stop.changed() => {
                        debug!("inbound stopped");
                        return;
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                post_fatal(&errors, &stop, e.into()).await;
                return;
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let eof = std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                );
                post_fatal(&errors, &stop, eof.into()).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                post_fatal(&errors, &stop, e.into()).await;
                return;
            }
        }
    }
}

/// Post a fatal error unless a shutdown is already in progress, in which
/// case it is swallowed.
async fn post_fatal(
    errors: &mpsc::Sender<ClientError>,
    stop: &watch::Receiver<bool>,
    err: ClientError,
) {
    if *stop.borrow() {
        debug!("inbound stopped");
        return;
    }
    error!(error = %err, "inbound stopped with error");
    let _ = errors.send(err).await;
}

/// Outbound activity: drain the publish and priority queues onto the wire,
/// stamping identifiers on QoS > 0 traffic.
#[allow(clippy::too_many_arguments)]
async fn outbound<S>(
    writer: Arc<Mutex<WriteHalf<S>>>,
    mut obound: mpsc::Receiver<Obound>,
    mut obound_p: mpsc::Receiver<OboundP>,
    ids: Arc<IdRegistry>,
    stats: Arc<Stats>,
    errors: mpsc::Sender<ClientError>,
    reset_ping: mpsc::Sender<()>,
    write_timeout: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    debug!("outbound started");
    let encoder = Encoder::new();
    let mut buf = BytesMut::with_capacity(2048);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("outbound stopped");
                return;
            }
            maybe = obound.recv() => {
                let Some(Obound { mut publish, token }) = maybe else { return };

                if publish.qos != QoS::AtMostOnce && publish.message_id.is_none() {
                    match ids.allocate(PendingAck::Publish(token.clone())) {
                        Ok(id) => {
                            publish.message_id = Some(id);
                            token.set_message_id(id);
                        }
                        Err(e) => {
                            token.token().fail(e);
                            continue;
                        }
                    }
                }

                let qos = publish.qos;
                let packet = Packet::Publish(publish);
                match encode_and_write(&encoder, &mut buf, &packet, &writer, write_timeout, &errors).await {
                    Ok(()) => {}
                    Err(WriteFailure::Encode(e)) => {
                        token.token().fail(e);
                        continue;
                    }
                    Err(WriteFailure::Transport) => return,
                }
                stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                if qos == QoS::AtMostOnce {
                    token.token().flow_complete();
                }
                let _ = reset_ping.try_send(());
            }
            maybe = obound_p.recv() => {
                let Some(OboundP { mut packet, token }) = maybe else { return };

                if let Err(e) = stamp_priority_id(&mut packet, &token, &ids) {
                    if let Some(pending) = &token {
                        pending.token().fail(e);
                    }
                    continue;
                }

                match encode_and_write(&encoder, &mut buf, &packet, &writer, write_timeout, &errors).await {
                    Ok(()) => {}
                    Err(WriteFailure::Encode(e)) => {
                        if let Some(pending) = &token {
                            pending.token().fail(e);
                        }
                        continue;
                    }
                    Err(WriteFailure::Transport) => return,
                }

                if matches!(packet, Packet::Disconnect) {
                    if let Some(pending) = &token {
                        pending.token().flow_complete();
                    }
                    debug!("outbound wrote disconnect, stopping");
                    return;
                }

                stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                let _ = reset_ping.try_send(());
            }
        }
    }
}

/// SUBSCRIBE and UNSUBSCRIBE draw their identifier here, next to the write,
/// so an id is only outstanding once its packet is about to hit the wire.
fn stamp_priority_id(
    packet: &mut Packet,
    token: &Option<PendingAck>,
    ids: &IdRegistry,
) -> Result<(), ClientError> {
    let (slot, pending) = match (packet, token) {
        (Packet::Subscribe(s), Some(p @ PendingAck::Subscribe(_))) => (&mut s.message_id, p),
        (Packet::Unsubscribe(u), Some(p @ PendingAck::Unsubscribe(_))) => (&mut u.message_id, p),
        _ => return Ok(()),
    };
    *slot = ids.allocate(pending.clone())?;
    Ok(())
}

enum WriteFailure {
    /// The packet could not be encoded; fail its token and keep writing
    Encode(ClientError),
    /// The transport failed; already posted, terminal for the writer
    Transport,
}

/// Encode one packet into the reused buffer and put it on the wire.
async fn encode_and_write<S>(
    encoder: &Encoder,
    buf: &mut BytesMut,
    packet: &Packet,
    writer: &Mutex<WriteHalf<S>>,
    write_timeout: Option<Duration>,
    errors: &mpsc::Sender<ClientError>,
) -> Result<(), WriteFailure>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    buf.clear();
    if let Err(e) = encoder.encode(packet, buf) {
        return Err(WriteFailure::Encode(e.into()));
    }
    if let Err(e) = write_packet(writer, buf, write_timeout).await {
        error!("outbound stopped with error");
        let _ = errors.send(e).await;
        return Err(WriteFailure::Transport);
    }
    Ok(())
}

/// Write and flush one encoded packet under the shared writer lock. The
/// deadline applies to this write only, so idle intervals never expire it.
async fn write_packet<S>(
    writer: &Mutex<WriteHalf<S>>,
    buf: &[u8],
    write_timeout: Option<Duration>,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut wr = writer.lock().await;
    let io = async {
        wr.write_all(buf).await?;
        wr.flush().await
    };
    match write_timeout {
        Some(deadline) => match timeout(deadline, io).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timeout exceeded",
            )
            .into()),
        },
        None => io.await.map_err(ClientError::from),
    }
}

/// Logic activity: the delivery state machine over inbound packets.
#[allow(clippy::too_many_arguments)]
async fn logic(
    mut ibound: mpsc::Receiver<Packet>,
    mut errors_rx: mpsc::Receiver<ClientError>,
    errors_tx: mpsc::Sender<ClientError>,
    obound_p: mpsc::Sender<OboundP>,
    incoming_pub: mpsc::Sender<Publish>,
    reset_ping_resp: mpsc::Sender<()>,
    ids: Arc<IdRegistry>,
    conn_lost: Arc<ConnLost>,
    mut stop: watch::Receiver<bool>,
) {
    debug!("logic started");
    loop {
        tokio::select! {
            _ = stop.changed() => {
                warn!("logic stopped");
                return;
            }
            maybe_err = errors_rx.recv() => {
                if let Some(err) = maybe_err {
                    error!(error = %err, "logic got error");
                    conn_lost.fire(err);
                }
                return;
            }
            maybe = ibound.recv() => {
                let Some(packet) = maybe else { return };
                let keep_going = handle_inbound(
                    packet,
                    &mut errors_rx,
                    &errors_tx,
                    &obound_p,
                    &incoming_pub,
                    &reset_ping_resp,
                    &ids,
                    &mut stop,
                )
                .await;
                if !keep_going {
                    return;
                }
            }
        }
    }
}

/// Apply the state machine to one inbound packet. Returns false when the
/// activity should exit.
#[allow(clippy::too_many_arguments)]
async fn handle_inbound(
    packet: Packet,
    errors_rx: &mut mpsc::Receiver<ClientError>,
    errors_tx: &mpsc::Sender<ClientError>,
    obound_p: &mpsc::Sender<OboundP>,
    incoming_pub: &mpsc::Sender<Publish>,
    reset_ping_resp: &mpsc::Sender<()>,
    ids: &IdRegistry,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    match packet {
        Packet::PingResp => {
            debug!("received pingresp");
            let _ = reset_ping_resp.try_send(());
        }
        Packet::SubAck(sa) => {
            debug!(id = sa.message_id, "received suback");
            if let Some(PendingAck::Subscribe(token)) = ids.lookup(sa.message_id) {
                match token.record_grants(&sa.granted_qos) {
                    Ok(()) => token.token().flow_complete(),
                    Err(e) => token.token().fail(e),
                }
            }
            ids.free(sa.message_id);
        }
        Packet::UnsubAck(ua) => {
            debug!(id = ua.message_id, "received unsuback");
            if let Some(pending) = ids.lookup(ua.message_id) {
                pending.token().flow_complete();
            }
            ids.free(ua.message_id);
        }
        Packet::Publish(publish) => {
            return handle_incoming_publish(
                publish,
                errors_rx,
                errors_tx,
                obound_p,
                incoming_pub,
                stop,
            )
            .await;
        }
        Packet::PubAck(pa) => {
            debug!(id = pa.message_id, "received puback");
            if let Some(pending) = ids.lookup(pa.message_id) {
                pending.token().flow_complete();
            }
            ids.free(pa.message_id);
        }
        Packet::PubRec(pr) => {
            debug!(id = pr.message_id, "received pubrec");
            let rel = OboundP {
                packet: Packet::PubRel(PubRel {
                    message_id: pr.message_id,
                }),
                token: None,
            };
            if timeout(ACK_POST_TIMEOUT, obound_p.send(rel)).await.is_err() {
                debug!(id = pr.message_id, "pubrel dropped, writer stalled");
            }
        }
        Packet::PubRel(pr) => {
            // Receiver side of QoS 2
            debug!(id = pr.message_id, "received pubrel");
            let comp = OboundP {
                packet: Packet::PubComp(PubComp {
                    message_id: pr.message_id,
                }),
                token: None,
            };
            if timeout(ACK_POST_TIMEOUT, obound_p.send(comp)).await.is_err() {
                debug!(id = pr.message_id, "pubcomp dropped, writer stalled");
            }
        }
        Packet::PubComp(pc) => {
            debug!(id = pc.message_id, "received pubcomp");
            if let Some(pending) = ids.lookup(pc.message_id) {
                pending.token().flow_complete();
            }
            ids.free(pc.message_id);
        }
        p @ (Packet::Connect(_)
        | Packet::ConnAck(_)
        | Packet::Subscribe(_)
        | Packet::Unsubscribe(_)
        | Packet::PingReq
        | Packet::Disconnect) => {
            warn!(
                packet_type = p.packet_type(),
                "unexpected inbound packet, ignoring"
            );
        }
    }
    true
}

/// Hand a PUBLISH to the router and synthesize the ack its QoS requires.
/// The router owns the packet from here; its buffers are released after
/// dispatch.
async fn handle_incoming_publish(
    publish: Publish,
    errors_rx: &mut mpsc::Receiver<ClientError>,
    errors_tx: &mpsc::Sender<ClientError>,
    obound_p: &mpsc::Sender<OboundP>,
    incoming_pub: &mpsc::Sender<Publish>,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    let message_id = publish.message_id.unwrap_or(0);
    debug!(id = message_id, qos = publish.qos as u8, "received publish");

    match publish.qos {
        QoS::AtMostOnce => {
            // If routing would block and an error arrives first, re-post
            // the error for the outer loop and abandon this message.
            tokio::select! {
                sent = incoming_pub.send(publish) => {
                    if sent.is_err() {
                        return false;
                    }
                }
                maybe_err = errors_rx.recv() => {
                    if let Some(err) = maybe_err {
                        let _ = errors_tx.try_send(err);
                    }
                }
                _ = stop.changed() => return false,
            }
        }
        QoS::AtLeastOnce => {
            tokio::select! {
                sent = incoming_pub.send(publish) => {
                    if sent.is_err() {
                        return false;
                    }
                }
                _ = stop.changed() => return false,
            }
            let ack = OboundP {
                packet: Packet::PubAck(PubAck { message_id }),
                token: None,
            };
            tokio::select! {
                sent = obound_p.send(ack) => {
                    if sent.is_err() {
                        return false;
                    }
                }
                _ = stop.changed() => return false,
            }
        }
        QoS::ExactlyOnce => {
            tokio::select! {
                sent = incoming_pub.send(publish) => {
                    if sent.is_err() {
                        return false;
                    }
                }
                _ = stop.changed() => return false,
            }
            let rec = OboundP {
                packet: Packet::PubRec(PubRec { message_id }),
                token: None,
            };
            tokio::select! {
                sent = obound_p.send(rec) => {
                    if sent.is_err() {
                        return false;
                    }
                }
                _ = stop.changed() => return false,
            }
        }
    }
    true
}

/// Keepalive activity: one timer for the idle interval, one armed only
/// while a PINGRESP is owed.
async fn keepalive<S>(
    writer: Arc<Mutex<WriteHalf<S>>>,
    keep_alive: Duration,
    ping_timeout: Duration,
    mut reset_ping: mpsc::Receiver<()>,
    mut reset_ping_resp: mpsc::Receiver<()>,
    conn_lost: Arc<ConnLost>,
    mut stop: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    debug!("keepalive started");
    let encoder = Encoder::new();
    let mut buf = BytesMut::with_capacity(4);

    let ping_timer = sleep(keep_alive);
    tokio::pin!(ping_timer);
    // Armed only after a PINGREQ goes out
    let ping_resp_timer = sleep(Duration::from_secs(86400));
    tokio::pin!(ping_resp_timer);
    let mut awaiting_resp = false;

    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("keepalive stopped");
                return;
            }
            Some(()) = reset_ping.recv() => {
                // Outbound traffic just happened, defer the next ping
                ping_timer.as_mut().reset(Instant::now() + ping_timeout);
            }
            Some(()) = reset_ping_resp.recv() => {
                awaiting_resp = false;
                ping_timer.as_mut().reset(Instant::now() + ping_timeout);
            }
            () = ping_timer.as_mut(), if !awaiting_resp => {
                debug!("keepalive sending ping");
                buf.clear();
                if encoder.encode(&Packet::PingReq, &mut buf).is_ok() {
                    // Written under the shared writer lock rather than
                    // queued, so the ping cannot wait behind large
                    // publishes on the priority queue.
                    let mut wr = writer.lock().await;
                    let write = async {
                        wr.write_all(&buf).await?;
                        wr.flush().await
                    };
                    if let Err(e) = write.await {
                        warn!(error = %e, "keepalive ping write failed");
                    }
                }
                awaiting_resp = true;
                ping_resp_timer.as_mut().reset(Instant::now() + ping_timeout);
            }
            () = ping_resp_timer.as_mut(), if awaiting_resp => {
                error!("pingresp not received, disconnecting");
                conn_lost.fire(ClientError::KeepaliveTimeout);
                return;
            }
        }
    }
}
