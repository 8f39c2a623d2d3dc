pub mod dispatcher;
pub mod message;
pub mod pool;
pub mod topic;

pub use dispatcher::TopicEvent;
pub use message::RawFrame;
pub use pool::{PoolConfig, PoolError, PubSubPool};
pub use topic::{Topic, TopicKind};
