use std::net::SocketAddr;

use crate::channel::{ChannelState, PendingNonces};
use crate::conversation::{ConversationAction, ConversationTopicHandler};
use crate::error::{Error, NetResult};
use crate::wire_protocol::messages::{
    PongMessage, ProtocolMessage, VerackMessage, VersionMessage,
};
use crate::wire_protocol::node::{NodeDesc, NodeServiceSet};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandshakeDirection {
    /// We dialed; our `version` opens the dialogue.
    Outbound,
    /// The peer dialed; we answer their `version` with our own.
    Inbound,
}

/// Handshake:
///
/// NodeA <---> NodeB
///    __version__ message, replied by __verack__ message (both)
///
/// - send __version__ message
/// - expect __verack__ message
/// - expect __version__ message
/// - respond with __verack__ message
/// => established
///
/// The two expectations may be satisfied in either order; the dialogue only
/// finishes once our own `version` has been acknowledged AND the peer's
/// `version` has arrived.
pub struct HandshakeTopic {
    me: NodeDesc,
    remote_addr: SocketAddr,
    direction: HandshakeDirection,
    own_nonce: u64,
    live_nonces: PendingNonces,
    version_msg_sent: bool,
    version_ack_received: bool,
    version_msg_received: Option<VersionMessage>,
}

impl HandshakeTopic {
    pub fn new(
        me: NodeDesc,
        remote_addr: SocketAddr,
        direction: HandshakeDirection,
        own_nonce: u64,
        live_nonces: PendingNonces,
    ) -> Self {
        HandshakeTopic {
            me,
            remote_addr,
            direction,
            own_nonce,
            live_nonces,
            version_msg_sent: false,
            version_ack_received: false,
            version_msg_received: None,
        }
    }

    /// The channel mirrors dialogue progress into its observable state.
    pub fn progress(&self) -> ChannelState {
        if self.version_msg_received.is_some() {
            ChannelState::VersionReceived
        } else if self.version_ack_received {
            ChannelState::VerackReceived
        } else if self.version_msg_sent {
            ChannelState::VersionSent
        } else {
            ChannelState::New
        }
    }

    fn own_version(&self) -> ProtocolMessage {
        ProtocolMessage::Version(VersionMessage::new(self.remote_addr, self.own_nonce, &self.me))
    }

    fn finished(&self) -> bool {
        self.version_msg_sent && self.version_ack_received && self.version_msg_received.is_some()
    }
}

impl ConversationTopicHandler for HandshakeTopic {
    type Outcome = NodeDesc;

    fn initial_action(&mut self) -> ConversationAction {
        match self.direction {
            HandshakeDirection::Outbound => {
                let message = self.own_version();
                self.version_msg_sent = true;
                ConversationAction::reply(message)
            }
            HandshakeDirection::Inbound => ConversationAction::nop(),
        }
    }

    fn on_message(&mut self, message: ProtocolMessage) -> NetResult<ConversationAction> {
        match message {
            ProtocolMessage::Version(m) => {
                if m.nonce != 0 && self.live_nonces.contains(m.nonce) {
                    return Err(Error::ChannelProxy(
                        "own version nonce echoed back (connected to self)".to_string(),
                    ));
                }
                if self.version_msg_received.is_some() {
                    return Err(Error::ChannelProxy("duplicate version message".to_string()));
                }
                self.version_msg_received = Some(m);

                let mut messages = vec![];
                if !self.version_msg_sent {
                    messages.push(self.own_version());
                    self.version_msg_sent = true;
                }
                messages.push(ProtocolMessage::Verack(VerackMessage));
                Ok(ConversationAction {
                    messages,
                    topic_finished: self.finished(),
                })
            }
            ProtocolMessage::Verack(_) => {
                if !self.version_msg_sent {
                    return Err(Error::ChannelProxy(
                        "received a 'verack', but no 'version' was sent yet".to_string(),
                    ));
                }
                self.version_ack_received = true;
                Ok(ConversationAction {
                    messages: vec![],
                    topic_finished: self.finished(),
                })
            }
            ProtocolMessage::Ping(ping) => {
                Ok(ConversationAction::reply(ProtocolMessage::Pong(PongMessage { nonce: ping.nonce })))
            }
            // anything else is premature; the dispatch loop takes over after
            // the handshake, so just let it pass
            _ => Ok(ConversationAction::nop()),
        }
    }

    fn outcome(self) -> NetResult<NodeDesc> {
        match self.version_msg_received {
            None => Err(Error::ChannelProxy("should have a version message from remote node".to_string())),
            Some(msg) => Ok(NodeDesc {
                chain: self.me.chain,
                protocol_version: msg.protocol_version,
                services: NodeServiceSet::from_bitmask(msg.services),
                sub_ver: msg.user_agent.clone(),
                start_height: msg.start_height,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::wire_protocol::node::{Chain, NodeService};

    use super::*;

    fn test_node() -> NodeDesc {
        NodeDesc {
            chain: Chain::Regtest,
            protocol_version: 70016,
            services: NodeServiceSet(vec![NodeService::NodeNetwork]),
            sub_ver: "/bitcoin-net:0.1.0/".to_string(),
            start_height: 0,
        }
    }

    fn peer_version(nonce: u64) -> ProtocolMessage {
        ProtocolMessage::Version(VersionMessage::new(
            "127.0.0.1:48444".parse().unwrap(),
            nonce,
            &test_node(),
        ))
    }

    fn outbound_topic(nonces: &PendingNonces) -> HandshakeTopic {
        let own_nonce = nonces.allocate();
        HandshakeTopic::new(
            test_node(),
            "127.0.0.1:18444".parse().unwrap(),
            HandshakeDirection::Outbound,
            own_nonce,
            nonces.clone(),
        )
    }

    #[test]
    fn outbound_flow_version_then_verack() {
        let nonces = PendingNonces::default();
        let mut topic = outbound_topic(&nonces);

        let initial = topic.initial_action();
        assert_eq!(initial.messages.len(), 1);
        assert!(matches!(initial.messages[0], ProtocolMessage::Version(_)));
        assert!(!initial.topic_finished);
        assert_eq!(topic.progress(), ChannelState::VersionSent);

        let action = topic.on_message(peer_version(99)).unwrap();
        assert!(matches!(action.messages[..], [ProtocolMessage::Verack(_)]));
        assert!(!action.topic_finished);
        assert_eq!(topic.progress(), ChannelState::VersionReceived);

        let action = topic.on_message(ProtocolMessage::Verack(VerackMessage)).unwrap();
        assert!(action.messages.is_empty());
        assert!(action.topic_finished);

        let peer = topic.outcome().unwrap();
        assert_eq!(peer.protocol_version, 70016);
    }

    #[test]
    fn outbound_flow_verack_then_version() {
        let nonces = PendingNonces::default();
        let mut topic = outbound_topic(&nonces);
        topic.initial_action();

        let action = topic.on_message(ProtocolMessage::Verack(VerackMessage)).unwrap();
        assert!(!action.topic_finished);
        assert_eq!(topic.progress(), ChannelState::VerackReceived);

        let action = topic.on_message(peer_version(99)).unwrap();
        assert!(action.topic_finished);
    }

    #[test]
    fn inbound_flow_answers_version_with_version_and_verack() {
        let nonces = PendingNonces::default();
        let own_nonce = nonces.allocate();
        let mut topic = HandshakeTopic::new(
            test_node(),
            "127.0.0.1:48444".parse().unwrap(),
            HandshakeDirection::Inbound,
            own_nonce,
            nonces.clone(),
        );

        let initial = topic.initial_action();
        assert!(initial.messages.is_empty());

        let action = topic.on_message(peer_version(99)).unwrap();
        assert!(matches!(
            action.messages[..],
            [ProtocolMessage::Version(_), ProtocolMessage::Verack(_)]
        ));

        let action = topic.on_message(ProtocolMessage::Verack(VerackMessage)).unwrap();
        assert!(action.topic_finished);
    }

    #[test]
    fn verack_before_version_sent_is_a_protocol_error() {
        let nonces = PendingNonces::default();
        let own_nonce = nonces.allocate();
        let mut topic = HandshakeTopic::new(
            test_node(),
            "127.0.0.1:48444".parse().unwrap(),
            HandshakeDirection::Inbound,
            own_nonce,
            nonces.clone(),
        );
        topic.initial_action();

        assert!(matches!(
            topic.on_message(ProtocolMessage::Verack(VerackMessage)),
            Err(Error::ChannelProxy(_))
        ));
    }

    #[test]
    fn echoed_live_nonce_is_a_self_connection() {
        let nonces = PendingNonces::default();
        let mut topic = outbound_topic(&nonces);
        topic.initial_action();

        let other_local = nonces.allocate();
        assert!(matches!(
            topic.on_message(peer_version(other_local)),
            Err(Error::ChannelProxy(_))
        ));
    }

    #[test]
    fn duplicate_version_is_a_protocol_error() {
        let nonces = PendingNonces::default();
        let mut topic = outbound_topic(&nonces);
        topic.initial_action();

        topic.on_message(peer_version(99)).unwrap();
        assert!(topic.on_message(peer_version(99)).is_err());
    }

    #[test]
    fn ping_during_handshake_is_answered() {
        let nonces = PendingNonces::default();
        let mut topic = outbound_topic(&nonces);
        topic.initial_action();

        let action = topic
            .on_message(ProtocolMessage::Ping(crate::wire_protocol::messages::PingMessage { nonce: 7 }))
            .unwrap();
        assert!(matches!(
            action.messages[..],
            [ProtocolMessage::Pong(PongMessage { nonce: 7 })]
        ));
    }
}
