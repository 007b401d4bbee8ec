use crate::error::NetResult;
use crate::wire_protocol::messages::ProtocolMessage;

pub struct ConversationAction {
    pub messages: Vec<ProtocolMessage>,
    pub topic_finished: bool,
}

impl ConversationAction {
    pub fn nop() -> Self {
        ConversationAction {
            messages: vec![],
            topic_finished: false,
        }
    }

    pub fn reply(message: ProtocolMessage) -> Self {
        ConversationAction {
            messages: vec![message],
            topic_finished: false,
        }
    }
}

/// A structured dialogue with a peer, driven by the channel's read loop.
pub trait ConversationTopicHandler {
    type Outcome;

    fn initial_action(&mut self) -> ConversationAction;
    fn on_message(&mut self, message: ProtocolMessage) -> NetResult<ConversationAction>;
    /// the result of this conversation, once it's finished
    fn outcome(self) -> NetResult<Self::Outcome>;
}
