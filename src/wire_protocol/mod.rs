pub mod buffer;
pub mod handshake;
pub mod messages;
pub mod node;
pub mod raw_message;
