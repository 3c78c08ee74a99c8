pub mod inbox;
pub mod message;
pub mod router;

pub use message::{Message, MessageKind, MessagePriority};
pub use router::{CommunicationRouter, Mailbox, Reply, RouterConfig, RouterStats};
