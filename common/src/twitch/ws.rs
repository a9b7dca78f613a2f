//! PubSub over WebSocket: a fleet of bounded-capacity connections with topic
//! distribution, keepalive, reconnection with exponential backoff and topic
//! replay, fanned in to a single message stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use eyre::{bail, eyre, Context, Result};
use flume::{Receiver, Sender};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::Authenticator;
use super::{generate_hex, PUBSUB_URL};
use crate::model::message::Message;
use crate::model::streamer::Streamer;
use crate::model::topic::PubSubTopic;

/// A connection carries at most this many topics.
pub const MAX_TOPICS_PER_CONN: usize = 50;
/// The pool holds at most this many connections.
pub const MAX_PUBSUB_CONNS: usize = 10;

const PING_INTERVAL: Duration = Duration::from_secs(4 * 60);
const PONG_DEATH_THRESHOLD: Duration = Duration::from_secs(5 * 60);
const MAX_FRAME_SIZE: usize = 128 << 10;
const WRITE_QUEUE_CAPACITY: usize = 64;
const OUT_CHANNEL_CAPACITY: usize = 32;
const MERGED_CHANNEL_CAPACITY: usize = 256;
const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);
const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct ClientFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<ClientFrameData<'a>>,
}

#[derive(Debug, Serialize)]
struct ClientFrameData<'a> {
    topics: Vec<String>,
    auth_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ServerFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<ServerFrameData>,
}

/// The payload of a MESSAGE frame. `message` is itself JSON, double-encoded.
#[derive(Debug, Deserialize)]
struct ServerFrameData {
    topic: String,
    message: String,
}

#[derive(Debug)]
struct ConnState {
    topics: Vec<PubSubTopic>,
    /// Topics queued while the socket was down, replayed on (re)connect.
    pending: Vec<PubSubTopic>,
    /// Nonce of each in-flight LISTEN, for error attribution.
    nonce_to_topic: HashMap<String, String>,
    last_pong: Instant,
    is_connected: bool,
    /// Set once a session gets past dialing; taken by the supervisor to
    /// decide whether the reconnect backoff resets.
    session_established: bool,
    last_msg_timestamp: Option<DateTime<Utc>>,
    last_msg_identifier: String,
}

impl ConnState {
    fn new() -> ConnState {
        ConnState {
            topics: Vec::with_capacity(MAX_TOPICS_PER_CONN),
            pending: Vec::new(),
            nonce_to_topic: HashMap::new(),
            last_pong: Instant::now(),
            is_connected: false,
            session_established: false,
            last_msg_timestamp: None,
            last_msg_identifier: String::new(),
        }
    }

    fn has_topic(&self, topic: &PubSubTopic) -> bool {
        self.topics.contains(topic)
    }

    /// Drops the message when `(identifier, timestamp)` repeats the previous
    /// one; Twitch occasionally double-delivers.
    fn dedup_and_record(&mut self, msg: &Message) -> bool {
        if self.last_msg_identifier == msg.identifier
            && self.last_msg_timestamp == Some(msg.timestamp)
        {
            return false;
        }
        self.last_msg_identifier = msg.identifier.clone();
        self.last_msg_timestamp = Some(msg.timestamp);
        true
    }
}

/// A single PubSub session slot. The struct outlives individual sockets:
/// `run` dials a fresh socket each time and replays the committed topic
/// list, so reconnects preserve subscriptions.
pub struct PubSubConnection {
    index: usize,
    auth: Arc<Authenticator>,
    write_tx: Sender<String>,
    write_rx: Receiver<String>,
    out_tx: Sender<Message>,
    out_rx: Receiver<Message>,
    state: Arc<Mutex<ConnState>>,
}

impl PubSubConnection {
    pub fn new(index: usize, auth: Arc<Authenticator>) -> PubSubConnection {
        let (write_tx, write_rx) = flume::bounded(WRITE_QUEUE_CAPACITY);
        let (out_tx, out_rx) = flume::bounded(OUT_CHANNEL_CAPACITY);
        PubSubConnection {
            index,
            auth,
            write_tx,
            write_rx,
            out_tx,
            out_rx,
            state: Arc::new(Mutex::new(ConnState::new())),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn topic_count(&self) -> usize {
        self.state.lock().unwrap().topics.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.topic_count() < MAX_TOPICS_PER_CONN
    }

    pub fn topics(&self) -> Vec<PubSubTopic> {
        self.state.lock().unwrap().topics.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().is_connected
    }

    /// The stream of decoded messages from this connection.
    pub fn messages(&self) -> Receiver<Message> {
        self.out_rx.clone()
    }

    /// Subscribes to topics. While the socket is down the topics are queued
    /// and the LISTEN goes out on the next (re)connect.
    pub fn subscribe(&self, topics: &[PubSubTopic]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for topic in topics {
            if state.has_topic(topic) {
                continue;
            }
            state.topics.push(topic.clone());

            if !state.is_connected {
                state.pending.push(topic.clone());
                continue;
            }

            self.send_listen(&mut state, topic)
                .wrap_err_with(|| format!("Subscribing to topic {topic}"))?;
        }
        Ok(())
    }

    /// Removes topics, batching them into a single UNLISTEN frame.
    pub fn unsubscribe(&self, topics: &[PubSubTopic]) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let topic_strings = topics.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        let auth_token = self.auth.auth_token();
        let nonce = generate_hex(8);
        let frame = serde_json::to_string(&ClientFrame {
            kind: "UNLISTEN",
            nonce: Some(&nonce),
            data: Some(ClientFrameData {
                topics: topic_strings.clone(),
                auth_token: &auth_token,
            }),
        })?;

        if state.is_connected {
            if let Err(err) = self.enqueue(frame) {
                warn!(conn = self.index, topics = ?topic_strings, "Failed to unlisten: {err:#}");
                return Err(err);
            }
        }

        state.topics.retain(|t| !topics.contains(t));
        state.pending.retain(|t| !topics.contains(t));
        debug!(conn = self.index, topics = ?topic_strings, "Unlistened from topics");
        Ok(())
    }

    fn send_listen(&self, state: &mut ConnState, topic: &PubSubTopic) -> Result<()> {
        let nonce = generate_hex(8);
        let topic_string = topic.to_string();
        state
            .nonce_to_topic
            .insert(nonce.clone(), topic_string.clone());

        let auth_token = self.auth.auth_token();
        let frame = serde_json::to_string(&ClientFrame {
            kind: "LISTEN",
            nonce: Some(&nonce),
            data: Some(ClientFrameData {
                topics: vec![topic_string.clone()],
                auth_token: &auth_token,
            }),
        })?;

        debug!(conn = self.index, topic = %topic_string, "Subscribing to topic");
        self.enqueue(frame)
    }

    fn enqueue(&self, frame: String) -> Result<()> {
        self.write_tx
            .try_send(frame)
            .map_err(|_| eyre!("Write queue full on conn #{}", self.index))
    }

    /// PING is best-effort; under write pressure it is dropped.
    fn enqueue_ping(&self) {
        enqueue_ping(&self.write_tx, self.index);
    }

    /// Taken by the supervisor after `run` returns: did this session get
    /// past dialing?
    fn take_session_established(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.session_established)
    }

    /// Dials the PubSub endpoint and runs one session: writer, pinger and
    /// the read loop, cooperating under one child cancel scope. Returns when
    /// the session dies or the token is cancelled.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_frame_size = Some(MAX_FRAME_SIZE);
        ws_config.max_message_size = Some(MAX_FRAME_SIZE);

        let (socket, _) = connect_async_with_config(PUBSUB_URL, Some(ws_config), false)
            .await
            .context("Dialing PubSub server")?;
        let (mut sink, mut stream) = socket.split();

        {
            let mut state = self.state.lock().unwrap();
            state.is_connected = true;
            state.session_established = true;
            state.last_pong = Instant::now();
            state.pending.clear();

            self.enqueue_ping();
            let topics = state.topics.clone();
            for topic in &topics {
                if let Err(err) = self.send_listen(&mut state, topic) {
                    warn!(conn = self.index, %topic, "Failed to replay topic: {err:#}");
                }
            }
        }

        let session = cancel.child_token();

        let writer: JoinHandle<()> = {
            let session = session.clone();
            let write_rx = self.write_rx.clone();
            let index = self.index;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = session.cancelled() => break,
                        frame = write_rx.recv_async() => match frame {
                            Ok(frame) => {
                                if let Err(err) = sink.send(WsMessage::Text(frame)).await {
                                    warn!(conn = index, "WebSocket write error: {err}");
                                    break;
                                }
                            }
                            Err(_) => break,
                        },
                    }
                }
            })
        };

        let pinger: JoinHandle<()> = {
            let session = session.clone();
            let state = Arc::clone(&self.state);
            let write_tx = self.write_tx.clone();
            let index = self.index;
            tokio::spawn(async move {
                let mut ticker = interval(PING_INTERVAL);
                ticker.tick().await; // first tick is immediate
                loop {
                    tokio::select! {
                        _ = session.cancelled() => break,
                        _ = ticker.tick() => {
                            let elapsed = state.lock().unwrap().last_pong.elapsed();
                            if elapsed > PONG_DEATH_THRESHOLD {
                                warn!(conn = index, ?elapsed, "No PONG in over 5 minutes, declaring session dead");
                                session.cancel();
                                break;
                            }
                            enqueue_ping(&write_tx, index);
                        }
                    }
                }
            })
        };

        let result = self.read_loop(&mut stream, &session).await;

        session.cancel();
        self.state.lock().unwrap().is_connected = false;
        let _ = writer.await;
        let _ = pinger.await;

        if cancel.is_cancelled() {
            return Ok(());
        }
        result
    }

    async fn read_loop<S>(&self, stream: &mut S, session: &CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = session.cancelled() => return Err(eyre!("Session cancelled on conn #{}", self.index)),
                frame = stream.next() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!(conn = self.index, "WebSocket read error: {err}");
                    return Err(eyre!("Read error on conn #{}: {err}", self.index));
                }
                None => return Err(eyre!("PubSub stream closed on conn #{}", self.index)),
            };

            let WsMessage::Text(text) = frame else { continue };

            let parsed: ServerFrame = match serde_json::from_str(&text) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(conn = self.index, "Failed to parse PubSub frame: {err}");
                    return Err(eyre!("Decode error on conn #{}: {err}", self.index));
                }
            };

            match parsed.kind.as_str() {
                "PONG" => self.state.lock().unwrap().last_pong = Instant::now(),
                "RECONNECT" => {
                    info!(conn = self.index, "Reconnect requested by server");
                    return Err(eyre!("Server requested reconnect on conn #{}", self.index));
                }
                "RESPONSE" => self.handle_listen_response(parsed.nonce, parsed.error),
                "MESSAGE" => {
                    if let Some(data) = parsed.data {
                        self.handle_message(data, session).await;
                    }
                }
                other => warn!(conn = self.index, kind = other, "Unknown PubSub frame"),
            }
        }
    }

    fn handle_listen_response(&self, nonce: Option<String>, error: Option<String>) {
        let nonce = nonce.unwrap_or_default();
        let failed_topic = self
            .state
            .lock()
            .unwrap()
            .nonce_to_topic
            .remove(&nonce)
            .unwrap_or_default();

        let Some(error) = error.filter(|e| !e.is_empty()) else {
            return;
        };

        warn!(
            conn = self.index,
            error = %error,
            topic = %failed_topic,
            nonce = %nonce,
            "PubSub LISTEN error"
        );
        if error == "ERR_BADAUTH" {
            warn!(
                conn = self.index,
                "Received ERR_BADAUTH, the auth token may be expired or invalid"
            );
        }
    }

    async fn handle_message(&self, data: ServerFrameData, session: &CancellationToken) {
        let msg = match Message::parse(&data.topic, &data.message) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(conn = self.index, topic = %data.topic, "Failed to parse PubSub message: {err:#}");
                return;
            }
        };

        if !self.state.lock().unwrap().dedup_and_record(&msg) {
            return;
        }

        tokio::select! {
            _ = session.cancelled() => {}
            res = self.out_tx.send_async(msg) => {
                if res.is_err() {
                    warn!(conn = self.index, "Message channel closed");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_message(&self, msg: Message) {
        self.out_tx.try_send(msg).unwrap();
    }

    #[cfg(test)]
    pub(crate) fn mark_connected(&self) {
        self.state.lock().unwrap().is_connected = true;
    }

    #[cfg(test)]
    pub(crate) fn queued_frames(&self) -> Vec<String> {
        self.write_rx.try_iter().collect()
    }

    #[cfg(test)]
    pub(crate) fn dedup_check(&self, msg: &Message) -> bool {
        self.state.lock().unwrap().dedup_and_record(msg)
    }
}

fn enqueue_ping(write_tx: &Sender<String>, index: usize) {
    match write_tx.try_send(r#"{"type":"PING"}"#.to_owned()) {
        Ok(()) => debug!(conn = index, "Sent PING"),
        Err(_) => warn!(conn = index, "Write queue full, dropping PING"),
    }
}

/// Where a new topic should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Existing(usize),
    NewConnection,
}

/// Subscribe policy: first connection with capacity, otherwise a new
/// connection, failing once the connection cap is hit.
fn plan_placement(
    topic_counts: &[usize],
    max_topics: usize,
    max_conns: usize,
) -> Result<Placement> {
    if let Some(i) = topic_counts.iter().position(|&count| count < max_topics) {
        return Ok(Placement::Existing(i));
    }
    if topic_counts.len() >= max_conns {
        bail!("Maximum number of PubSub connections ({max_conns}) reached");
    }
    Ok(Placement::NewConnection)
}

struct PoolConn {
    conn: Arc<PubSubConnection>,
    supervisor: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

/// Up to [`MAX_PUBSUB_CONNS`] connections with their supervisors and
/// forwarders, fanned in to one merged channel consumed by the router.
pub struct PubSubPool {
    conns: Vec<PoolConn>,
    auth: Arc<Authenticator>,
    cancel: CancellationToken,
    merged_tx: Sender<Message>,
    merged_rx: Option<Receiver<Message>>,
}

impl PubSubPool {
    pub fn new(auth: Arc<Authenticator>, cancel: CancellationToken) -> PubSubPool {
        let (merged_tx, merged_rx) = flume::bounded(MERGED_CHANNEL_CAPACITY);
        PubSubPool {
            conns: Vec::new(),
            auth,
            cancel,
            merged_tx,
            merged_rx: Some(merged_rx),
        }
    }

    /// The merged message stream. Single consumer; taken once by the router.
    pub fn take_messages(&mut self) -> Receiver<Message> {
        self.merged_rx
            .take()
            .expect("Pool message stream already taken")
    }

    /// Distributes topics across connections, creating new ones as needed.
    /// Invalid topics (empty channel id) and duplicates are skipped.
    pub fn subscribe(&mut self, topics: &[PubSubTopic]) -> Result<()> {
        for topic in topics {
            if !topic.is_valid() {
                warn!(
                    topic = %topic.kind,
                    streamer = topic.login().unwrap_or(""),
                    "Skipping subscription for topic with empty channel id"
                );
                continue;
            }

            if self.conns.iter().any(|c| c.conn.topics().contains(topic)) {
                debug!(%topic, "Topic already subscribed");
                continue;
            }

            let counts = self
                .conns
                .iter()
                .map(|c| c.conn.topic_count())
                .collect::<Vec<_>>();
            match plan_placement(&counts, MAX_TOPICS_PER_CONN, MAX_PUBSUB_CONNS)? {
                Placement::Existing(i) => {
                    self.conns[i].conn.subscribe(std::slice::from_ref(topic))?
                }
                Placement::NewConnection => {
                    let conn = self.add_connection();
                    conn.subscribe(std::slice::from_ref(topic))?;
                }
            }
        }
        Ok(())
    }

    /// Removes topics from whichever connection holds them.
    pub fn unsubscribe(&mut self, topics: &[PubSubTopic]) {
        for topic in topics {
            let holder = self
                .conns
                .iter()
                .find(|c| c.conn.topics().contains(topic));
            match holder {
                Some(holder) => {
                    if let Err(err) = holder.conn.unsubscribe(std::slice::from_ref(topic)) {
                        warn!(%topic, "Failed to unsubscribe topic: {err:#}");
                    }
                }
                None => warn!(%topic, "Topic not found in any connection"),
            }
        }
    }

    /// Removes every channel-scoped topic belonging to a streamer.
    pub fn unsubscribe_streamer(&mut self, streamer: &Streamer) {
        let to_remove = self
            .conns
            .iter()
            .flat_map(|c| c.conn.topics())
            .filter(|t| !t.is_user_topic() && t.id() == streamer.channel_id)
            .collect::<Vec<_>>();

        if to_remove.is_empty() {
            warn!(streamer = %streamer.login, "No topics found");
            return;
        }

        debug!(
            streamer = %streamer.login,
            count = to_remove.len(),
            "Unsubscribing from streamer topics"
        );
        self.unsubscribe(&to_remove);
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Sum of topic counts across all connections; equals the number of
    /// distinct subscribed topics.
    pub fn total_topic_count(&self) -> usize {
        self.conns.iter().map(|c| c.conn.topic_count()).sum()
    }

    /// Snapshot of connection handles, for the health monitor.
    pub fn connections(&self) -> Vec<Arc<PubSubConnection>> {
        self.conns.iter().map(|c| Arc::clone(&c.conn)).collect()
    }

    fn add_connection(&mut self) -> Arc<PubSubConnection> {
        let conn = Arc::new(PubSubConnection::new(
            self.conns.len(),
            Arc::clone(&self.auth),
        ));

        let supervisor = tokio::spawn(supervise_connection(
            Arc::clone(&conn),
            self.cancel.clone(),
        ));
        let forwarder = tokio::spawn(forward_messages(
            conn.messages(),
            self.merged_tx.clone(),
            self.cancel.clone(),
        ));

        info!(
            conn = conn.index(),
            total_connections = self.conns.len() + 1,
            "Created new PubSub connection"
        );
        self.conns.push(PoolConn {
            conn: Arc::clone(&conn),
            supervisor,
            forwarder,
        });
        conn
    }
}

impl Drop for PubSubPool {
    fn drop(&mut self) {
        for conn in &self.conns {
            conn.supervisor.abort();
            conn.forwarder.abort();
        }
    }
}

/// Per-connection supervisor: runs sessions back to back, waiting
/// `backoff` between attempts (1s doubling up to 60s, reset once a session
/// establishes). The committed topic list survives inside the connection,
/// so every new session re-LISTENs exactly what the lost one held.
async fn supervise_connection(conn: Arc<PubSubConnection>, cancel: CancellationToken) {
    let mut backoff = RECONNECT_BACKOFF_START;

    loop {
        let result = conn.run(&cancel).await;
        let established = conn.take_session_established();

        if cancel.is_cancelled() {
            return;
        }

        if let Err(err) = result {
            warn!(
                conn = conn.index(),
                ?backoff,
                "PubSub connection lost, reconnecting: {err:#}"
            );
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(backoff) => {}
        }

        if established {
            backoff = RECONNECT_BACKOFF_START;
            info!(conn = conn.index(), "PubSub connection re-establishing");
        } else {
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
    }
}

/// Drains one connection's out-channel into the merged channel, preserving
/// arrival order. Exits when the source closes or the scope is cancelled.
async fn forward_messages(
    source: Receiver<Message>,
    merged: Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = source.recv_async() => match msg {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            res = merged.send_async(msg) => {
                if res.is_err() {
                    return;
                }
            }
        }
    }
}

/// Logs connections that report themselves dead, for observability only;
/// reconnection is the supervisor's job.
pub async fn health_monitor(conns: impl Fn() -> Vec<Arc<PubSubConnection>>, cancel: CancellationToken) {
    let mut ticker = interval(HEALTH_MONITOR_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                for conn in conns() {
                    if !conn.is_connected() {
                        warn!(
                            conn = conn.index(),
                            topics = conn.topic_count(),
                            "Connection is not connected"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;
    use crate::model::topic::TopicKind;

    fn test_auth() -> Arc<Authenticator> {
        Arc::new(Authenticator::with_token_for_tests("tester", "token", "1"))
    }

    fn channel_topic(kind: TopicKind, id: u32) -> PubSubTopic {
        PubSubTopic::channel(kind, id.to_string(), format!("streamer{id}"))
    }

    fn test_pool() -> PubSubPool {
        PubSubPool::new(test_auth(), CancellationToken::new())
    }

    #[test]
    fn placement_fills_first_available() {
        assert_eq!(
            plan_placement(&[3, 50], 50, 10).unwrap(),
            Placement::Existing(0)
        );
        assert_eq!(
            plan_placement(&[50, 4], 50, 10).unwrap(),
            Placement::Existing(1)
        );
        assert_eq!(plan_placement(&[], 50, 10).unwrap(), Placement::NewConnection);
        assert_eq!(
            plan_placement(&[50, 50], 50, 10).unwrap(),
            Placement::NewConnection
        );
    }

    #[test]
    fn placement_rejects_at_connection_cap() {
        let full = vec![50usize; 10];
        assert!(plan_placement(&full, 50, 10).is_err());
    }

    #[tokio::test]
    async fn pool_distributes_topics_across_connections() {
        let mut pool = test_pool();

        let topics = (0..60)
            .map(|i| channel_topic(TopicKind::VideoPlayback, i))
            .collect::<Vec<_>>();
        pool.subscribe(&topics).unwrap();

        assert_eq!(pool.connection_count(), 2);
        assert_eq!(pool.total_topic_count(), 60);
        let conns = pool.connections();
        assert_eq!(conns[0].topic_count(), 50);
        assert_eq!(conns[1].topic_count(), 10);
        assert!(conns.iter().all(|c| c.topic_count() <= MAX_TOPICS_PER_CONN));
    }

    #[tokio::test]
    async fn pool_skips_duplicates_and_invalid_topics() {
        let mut pool = test_pool();

        let topic = channel_topic(TopicKind::Raid, 7);
        let invalid = PubSubTopic::channel(TopicKind::Raid, "", "ghost");
        pool.subscribe(&[topic.clone(), topic.clone(), invalid]).unwrap();

        assert_eq!(pool.total_topic_count(), 1);
    }

    #[tokio::test]
    async fn pool_rejects_when_every_connection_is_full() {
        let mut pool = test_pool();

        let topics = (0..(MAX_PUBSUB_CONNS as u32 * MAX_TOPICS_PER_CONN as u32))
            .map(|i| channel_topic(TopicKind::VideoPlayback, i))
            .collect::<Vec<_>>();
        pool.subscribe(&topics).unwrap();
        assert_eq!(pool.connection_count(), MAX_PUBSUB_CONNS);

        let overflow = channel_topic(TopicKind::VideoPlayback, 100_000);
        assert!(pool.subscribe(&[overflow]).is_err());
    }

    #[tokio::test]
    async fn unsubscribe_streamer_removes_channel_topics_only() {
        let mut pool = test_pool();

        let streamer = Streamer::new("streamer7", "7");
        pool.subscribe(&[
            channel_topic(TopicKind::VideoPlayback, 7),
            channel_topic(TopicKind::Raid, 7),
            channel_topic(TopicKind::PredictionsChannel, 7),
            channel_topic(TopicKind::VideoPlayback, 8),
            PubSubTopic::user(TopicKind::CommunityPointsUser, "7"),
        ])
        .unwrap();
        assert_eq!(pool.total_topic_count(), 5);

        pool.unsubscribe_streamer(&streamer);

        assert_eq!(pool.total_topic_count(), 2);
        let remaining = pool.connections()[0].topics();
        assert!(remaining.contains(&channel_topic(TopicKind::VideoPlayback, 8)));
        assert!(remaining.contains(&PubSubTopic::user(TopicKind::CommunityPointsUser, "7")));
    }

    #[tokio::test]
    async fn forwarder_preserves_order_into_merged_channel() {
        let mut pool = test_pool();
        let merged = pool.take_messages();

        pool.subscribe(&[channel_topic(TopicKind::VideoPlayback, 1)])
            .unwrap();
        let conn = pool.connections()[0].clone();

        for i in 0..5 {
            let inner = format!(r#"{{"type":"viewcount","viewers":{i}}}"#);
            conn.inject_message(Message::parse("video-playback-by-id.1", &inner).unwrap());
        }

        for i in 0..5 {
            let msg = merged.recv_async().await.unwrap();
            assert_eq!(msg.raw.as_ref().unwrap()["viewers"], i);
        }
    }

    #[test]
    fn connection_queues_topics_while_down() {
        let conn = PubSubConnection::new(0, test_auth());
        let topic = channel_topic(TopicKind::VideoPlayback, 1);

        conn.subscribe(&[topic.clone()]).unwrap();
        assert_eq!(conn.topic_count(), 1);
        // Down: nothing goes out on the wire yet.
        assert!(conn.queued_frames().is_empty());

        conn.subscribe(&[topic]).unwrap();
        assert_eq!(conn.topic_count(), 1, "duplicate subscribe is a no-op");
    }

    #[test]
    fn connection_sends_listen_when_up() {
        let conn = PubSubConnection::new(0, test_auth());
        conn.mark_connected();
        conn.subscribe(&[channel_topic(TopicKind::Raid, 3)]).unwrap();

        let frames = conn.queued_frames();
        assert_eq!(frames.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "LISTEN");
        assert_eq!(frame["data"]["topics"][0], "raid.3");
        assert_eq!(frame["data"]["auth_token"], "token");
        assert_eq!(frame["nonce"].as_str().unwrap().len(), 16);
    }

    #[test]
    fn unsubscribe_batches_one_unlisten_frame(){
        let conn = PubSubConnection::new(0, test_auth());
        conn.mark_connected();
        let topics = [
            channel_topic(TopicKind::VideoPlayback, 4),
            channel_topic(TopicKind::Raid, 4),
        ];
        conn.subscribe(&topics).unwrap();
        conn.queued_frames();

        conn.unsubscribe(&topics).unwrap();
        let frames = conn.queued_frames();
        assert_eq!(frames.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "UNLISTEN");
        assert_eq!(frame["data"]["topics"].as_array().unwrap().len(), 2);
        assert_eq!(conn.topic_count(), 0);
    }

    #[test]
    fn dedup_drops_repeated_identifier_and_timestamp() {
        let conn = PubSubConnection::new(0, test_auth());
        let now = Utc::now();

        let mut msg = Message::parse(
            "video-playback-by-id.1",
            r#"{"type":"stream-up","server_time":1700000000.0}"#,
        )
        .unwrap();
        msg.timestamp = now;

        assert!(conn.dedup_check(&msg));
        assert!(!conn.dedup_check(&msg), "exact duplicate must be dropped");

        let mut later = msg.clone();
        later.timestamp = now + chrono::Duration::seconds(1);
        assert!(conn.dedup_check(&later), "same id, new timestamp passes");
    }
}
