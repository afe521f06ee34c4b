//! Carriers for messages between the stub and the skeleton.
//!
//! A transport belongs to a single handle. Ownership of a message moves into the
//! transport with a call and comes back with the reply, a message is returned to
//! its pool exactly once by dropping it or handing it to [`Transport::free`].

pub mod inline;
pub mod loopback;

use crate::message::Message;
use remote_commons::TransportError;
use std::time::Duration;

/// How long [`Transport::await_completion`] blocks for a reply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// check once without blocking
    Poll,
    After(Duration),
    Forever,
}

pub trait Transport: Send {
    /// Take a message from the pool of this transport, `None` if the pool is exhausted
    fn allocate(&self) -> Option<Message>;
    fn free(&self, message: Message);
    /// Deliver the message and block until the reply is there
    fn call_blocking(&mut self, message: Message) -> Result<Message, TransportError>;
    /// Deliver the message without waiting for the reply
    fn call_non_blocking(&mut self, message: Message) -> Result<(), TransportError>;
    /// Reply to the last non blocking call, `Ok(None)` if it did not arrive in time
    fn await_completion(&mut self, timeout: Timeout) -> Result<Option<Message>, TransportError>;
    /// Largest message this transport can carry
    fn max_payload_size(&self) -> usize;
    /// The skeleton runs in the caller's own context
    fn is_local(&self) -> bool {
        false
    }
}
