//! NATS JetStream transport.

mod aborts;
mod publisher;
mod subscriber;

pub use aborts::{NatsAborts, DEFAULT_ABORT_BUCKET};
pub use publisher::{
    progress_subject, NatsBus, NatsError, DEFAULT_STREAM, NOT_BEFORE_HEADER, STEP_SUBJECTS,
};
pub use subscriber::{ack, decode, in_progress, nack, term, Decoded, NatsSubscriber};
