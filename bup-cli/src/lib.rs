//! Client for the bup-server WebSocket protocol.

pub mod channel;
pub mod filter;
pub mod logger;

pub use channel::{Channel, ChannelError, Result, Subscription};
pub use filter::MessageFilter;
