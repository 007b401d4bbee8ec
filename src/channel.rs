use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::authority::Authority;
use crate::conversation::ConversationTopicHandler;
use crate::error::{Error, NetResult};
use crate::settings::Settings;
use crate::wire_protocol::handshake::{HandshakeDirection, HandshakeTopic};
use crate::wire_protocol::messages::{PongMessage, ProtocolMessage};
use crate::wire_protocol::node::{Chain, NodeDesc};
use crate::wire_protocol::raw_message::{Command, MessageParseOutcome, RawMessage};
use crate::wire_protocol::buffer::IOBuffer;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    New,
    VersionSent,
    VersionReceived,
    VerackReceived,
    Established,
    Closed,
}

/// The version nonces of all channels this service currently has in flight.
/// A peer echoing one of them back in its `version` is ourselves on the
/// other end of the wire.
#[derive(Clone, Default)]
pub struct PendingNonces(Arc<Mutex<HashSet<u64>>>);

impl PendingNonces {
    pub fn allocate(&self) -> u64 {
        let mut set = self.0.lock().unwrap();
        loop {
            let nonce = thread_rng().gen::<u64>();
            if nonce != 0 && set.insert(nonce) {
                return nonce;
            }
        }
    }

    pub fn contains(&self, nonce: u64) -> bool {
        self.0.lock().unwrap().contains(&nonce)
    }

    pub fn remove(&self, nonce: u64) {
        self.0.lock().unwrap().remove(&nonce);
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Deadlines {
    pub handshake: Duration,
    pub inactivity: Duration,
    pub expiration: Duration,
}

impl Deadlines {
    pub fn from_settings(settings: &Settings) -> Self {
        Deadlines {
            handshake: settings.handshake_timeout(),
            inactivity: settings.inactivity_timeout(),
            expiration: settings.expiration_timeout(),
        }
    }
}

/// One live transport connection: owns the socket halves, drives the
/// version handshake, then reads and dispatches messages until a timer,
/// a transport failure or an explicit stop closes it. Closing is terminal
/// and idempotent; the first error observed is latched and reported.
pub struct Channel {
    nonce: u64,
    authority: Authority,
    chain: Chain,
    desc: NodeDesc,
    direction: HandshakeDirection,
    deadlines: Deadlines,
    nonces: PendingNonces,
    state_tx: watch::Sender<ChannelState>,
    germinated_tx: watch::Sender<bool>,
    error: Mutex<Option<Error>>,
    peer: Mutex<Option<NodeDesc>>,
    reader: Mutex<Option<ReadHalf<TcpStream>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<TcpStream>>>,
    subscribers: Mutex<HashMap<Command, Vec<mpsc::UnboundedSender<ProtocolMessage>>>>,
}

impl Channel {
    /// Wraps an already-connected socket (the accept path).
    pub(crate) fn attach(
        socket: TcpStream,
        direction: HandshakeDirection,
        desc: NodeDesc,
        settings: &Settings,
        nonces: PendingNonces,
    ) -> NetResult<Arc<Self>> {
        let authority = Authority::from(socket.peer_addr()?);
        let (read, write) = tokio::io::split(socket);
        let nonce = nonces.allocate();
        let chain = desc.chain;

        Ok(Arc::new(Channel {
            nonce,
            authority,
            chain,
            desc,
            direction,
            deadlines: Deadlines::from_settings(settings),
            nonces,
            state_tx: watch::channel(ChannelState::New).0,
            germinated_tx: watch::channel(false).0,
            error: Mutex::new(None),
            peer: Mutex::new(None),
            reader: Mutex::new(Some(read)),
            writer: tokio::sync::Mutex::new(Some(write)),
            subscribers: Mutex::new(HashMap::new()),
        }))
    }

    /// Dials an authority under the configured connect timeout (the connect
    /// path).
    pub(crate) async fn connect(
        authority: Authority,
        desc: NodeDesc,
        settings: &Settings,
        nonces: PendingNonces,
    ) -> NetResult<Arc<Self>> {
        let socket = match time::timeout(settings.connect_timeout(), TcpStream::connect(authority.socket_addr())).await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => return Err(err.into()),
            Err(_elapsed) => return Err(Error::ChannelTimeout),
        };
        Self::attach(socket, HandshakeDirection::Outbound, desc, settings, nonces)
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// What the peer told us about itself; available once established.
    pub fn peer_desc(&self) -> Option<NodeDesc> {
        self.peer.lock().unwrap().clone()
    }

    /// The first error observed on this channel, if any.
    pub fn last_error(&self) -> Option<Error> {
        self.error.lock().unwrap().clone()
    }

    /// Registers interest in post-handshake inbound messages of one command.
    pub fn subscribe(&self, command: Command) -> mpsc::UnboundedReceiver<ProtocolMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().entry(command).or_default().push(tx);
        rx
    }

    /// Runs the handshake and, on success, spawns the dispatch loop.
    /// Completes exactly once: with `Ok` at *established* or with the first
    /// error observed, the channel then being closed.
    pub async fn start(self: &Arc<Self>) -> NetResult<()> {
        let reader = self.reader.lock().unwrap().take();
        let Some(mut read) = reader else {
            return Err(Error::OperationFailed);
        };

        let mut buffer = IOBuffer::default();
        match time::timeout(self.deadlines.handshake, self.handshake(&mut read, &mut buffer)).await {
            Ok(Ok(())) => {
                self.transition(ChannelState::Established);
                log::info!("channel to {} established", self.authority);
                tokio::spawn(Arc::clone(self).dispatch(read, buffer));
                Ok(())
            }
            Ok(Err(code)) => {
                self.stop(code.clone()).await;
                Err(code)
            }
            Err(_elapsed) => {
                self.stop(Error::ChannelTimeout).await;
                Err(Error::ChannelTimeout)
            }
        }
    }

    /// Serializes and writes one message. Completions on a single channel
    /// occur in call order; a transport failure closes the channel.
    pub async fn send(&self, message: ProtocolMessage) -> NetResult<()> {
        let bytes = message.to_bytes(self.chain);
        log::debug!("sending '{}' to {}", message.command(), self.authority);

        let mut writer = self.writer.lock().await;
        let Some(write) = writer.as_mut() else {
            return Err(self.last_error().unwrap_or(Error::ChannelStopped));
        };
        match write.write_all(&bytes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let code = Error::from(err);
                drop(writer);
                self.stop(code.clone()).await;
                Err(code)
            }
        }
    }

    /// Latches `code` as the channel's error (first writer wins), moves to
    /// *closed* and shuts the transport down. Safe to call in any state.
    pub async fn stop(&self, code: Error) {
        {
            let mut latched = self.error.lock().unwrap();
            if latched.is_none() {
                *latched = Some(code);
            }
        }

        let previous = self.state_tx.send_replace(ChannelState::Closed);
        if previous == ChannelState::Closed {
            return;
        }
        log::debug!("channel to {} closed: {:?}", self.authority, self.last_error());

        self.nonces.remove(self.nonce);
        let mut writer = self.writer.lock().await;
        if let Some(mut write) = writer.take() {
            let _ = write.shutdown().await;
        }
    }

    /// Resolves once the channel has reached *closed*.
    pub async fn closed(&self) {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            if *state_rx.borrow_and_update() == ChannelState::Closed {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves on the first post-handshake inbound message. Returns false
    /// when the channel closed without ever producing one.
    pub async fn germinated(&self) -> bool {
        let mut germinated_rx = self.germinated_tx.subscribe();
        let mut state_rx = self.state_tx.subscribe();
        loop {
            if *germinated_rx.borrow_and_update() {
                return true;
            }
            if *state_rx.borrow_and_update() == ChannelState::Closed {
                return false;
            }
            tokio::select! {
                changed = germinated_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn transition(&self, state: ChannelState) {
        self.state_tx.send_modify(|current| {
            if *current != ChannelState::Closed {
                *current = state;
            }
        });
    }

    async fn handshake(&self, read: &mut ReadHalf<TcpStream>, buffer: &mut IOBuffer) -> NetResult<()> {
        let mut topic = HandshakeTopic::new(
            self.desc.clone(),
            self.authority.socket_addr(),
            self.direction,
            self.nonce,
            self.nonces.clone(),
        );

        let initial = topic.initial_action();
        for message in initial.messages {
            self.send(message).await?;
        }
        self.transition(topic.progress());

        let mut finished = initial.topic_finished;
        while !finished {
            let n = read.read(buffer.expose_writable_part()).await?;
            if n == 0 {
                return Err(Error::Io("remote node hung up".to_string()));
            }
            buffer.register_added_content(n);

            loop {
                match RawMessage::try_consume_message(buffer, self.chain)? {
                    MessageParseOutcome::Message(raw) => {
                        let message = ProtocolMessage::try_from(raw)?;
                        let action = topic.on_message(message)?;
                        for reply in action.messages {
                            self.send(reply).await?;
                        }
                        self.transition(topic.progress());
                        if action.topic_finished {
                            finished = true;
                            break;
                        }
                    }
                    MessageParseOutcome::SkippedMessage => {}
                    MessageParseOutcome::NoMessage => break,
                }
            }
        }

        let peer = topic.outcome()?;
        log::debug!("handshake with {} complete: {:?}", self.authority, peer);
        *self.peer.lock().unwrap() = Some(peer);
        Ok(())
    }

    /// Post-handshake read loop: consumes frames, answers pings, feeds
    /// subscribers, and enforces the inactivity and expiration deadlines.
    /// Any leftover bytes the handshake already buffered are drained first.
    async fn dispatch(self: Arc<Self>, mut read: ReadHalf<TcpStream>, mut buffer: IOBuffer) {
        if let Err(code) = self.drain(&mut buffer).await {
            self.stop(code).await;
            return;
        }

        let expiration = Instant::now() + self.deadlines.expiration;
        let mut state_rx = self.state_tx.subscribe();
        let mut last_read = Instant::now();

        loop {
            if *state_rx.borrow_and_update() == ChannelState::Closed {
                break;
            }
            tokio::select! {
                result = read.read(buffer.expose_writable_part()) => match result {
                    Ok(0) => {
                        self.stop(Error::ChannelStopped).await;
                        break;
                    }
                    Ok(n) => {
                        last_read = Instant::now();
                        buffer.register_added_content(n);
                        if let Err(code) = self.drain(&mut buffer).await {
                            self.stop(code).await;
                            break;
                        }
                    }
                    Err(err) => {
                        self.stop(Error::from(err)).await;
                        break;
                    }
                },
                _ = time::sleep_until(last_read + self.deadlines.inactivity) => {
                    log::debug!("channel to {} idle too long", self.authority);
                    self.stop(Error::ChannelTimeout).await;
                    break;
                }
                _ = time::sleep_until(expiration) => {
                    log::debug!("channel to {} reached its lifetime limit", self.authority);
                    self.stop(Error::ChannelTimeout).await;
                    break;
                }
                _ = state_rx.changed() => {}
            }
        }
    }

    async fn drain(&self, buffer: &mut IOBuffer) -> NetResult<()> {
        loop {
            match RawMessage::try_consume_message(buffer, self.chain)? {
                MessageParseOutcome::Message(raw) => {
                    let message = ProtocolMessage::try_from(raw)?;
                    self.deliver(message).await?;
                }
                MessageParseOutcome::SkippedMessage => {}
                MessageParseOutcome::NoMessage => return Ok(()),
            }
        }
    }

    async fn deliver(&self, message: ProtocolMessage) -> NetResult<()> {
        self.germinated_tx.send_replace(true);

        if let ProtocolMessage::Ping(ping) = &message {
            self.send(ProtocolMessage::Pong(PongMessage { nonce: ping.nonce })).await?;
        }

        let command = message.command();
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get_mut(&command) {
            list.retain(|subscriber| subscriber.send(message.clone()).is_ok());
        }
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // covers channels discarded before ever being started
        self.nonces.remove(self.nonce);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pending_nonces_allocate_unique_nonzero() {
        let nonces = PendingNonces::default();
        let a = nonces.allocate();
        let b = nonces.allocate();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert!(nonces.contains(a));
        nonces.remove(a);
        assert!(!nonces.contains(a));
    }

    #[tokio::test]
    async fn attached_channel_reports_identity_and_rejects_double_start() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let mut settings = Settings::regtest();
        settings.channel_handshake_seconds = 0;
        let desc = NodeDesc {
            chain: settings.network,
            protocol_version: settings.protocol_version,
            services: crate::wire_protocol::node::NodeServiceSet::from_bitmask(settings.services),
            sub_ver: settings.user_agent.clone(),
            start_height: 0,
        };
        let nonces = PendingNonces::default();
        let channel = Channel::attach(client, HandshakeDirection::Outbound, desc, &settings, nonces.clone()).unwrap();

        assert_eq!(channel.authority(), Authority::from(addr));
        assert_eq!(channel.state(), ChannelState::New);
        assert!(nonces.contains(channel.nonce()));

        // zero handshake allowance: start fails with a timeout and closes
        assert_eq!(channel.start().await, Err(Error::ChannelTimeout));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.last_error(), Some(Error::ChannelTimeout));
        assert!(!nonces.contains(channel.nonce()));

        // terminal state: another start cannot revive the channel
        assert!(channel.start().await.is_err());
        assert_eq!(
            channel.send(ProtocolMessage::Verack(crate::wire_protocol::messages::VerackMessage)).await,
            Err(Error::ChannelTimeout)
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_latches_first_code() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let settings = Settings::regtest();
        let desc = NodeDesc {
            chain: settings.network,
            protocol_version: settings.protocol_version,
            services: crate::wire_protocol::node::NodeServiceSet::from_bitmask(settings.services),
            sub_ver: settings.user_agent.clone(),
            start_height: 0,
        };
        let channel =
            Channel::attach(client, HandshakeDirection::Outbound, desc, &settings, PendingNonces::default()).unwrap();

        channel.stop(Error::ChannelStopped).await;
        channel.stop(Error::ChannelTimeout).await;
        assert_eq!(channel.last_error(), Some(Error::ChannelStopped));
        channel.closed().await;
    }
}
