use crate::{
    message::{Message, MessagePool},
    skeleton::Skeleton,
    transport::{Timeout, Transport},
};
use remote_commons::TransportError;

/// Transport for instances living in the caller's own domain.
/// The skeleton runs on the calling thread, so there is no asynchronous mode.
pub struct InlineTransport {
    pool: MessagePool,
    skeleton: Skeleton,
}

impl InlineTransport {
    pub fn new(pool: MessagePool, skeleton: Skeleton) -> Self {
        InlineTransport { pool, skeleton }
    }
}

impl Transport for InlineTransport {
    fn allocate(&self) -> Option<Message> {
        self.pool.allocate()
    }

    fn free(&self, message: Message) {
        self.pool.free(message);
    }

    fn call_blocking(&mut self, mut message: Message) -> Result<Message, TransportError> {
        self.skeleton.call(&mut message);
        Ok(message)
    }

    fn call_non_blocking(&mut self, _message: Message) -> Result<(), TransportError> {
        Err(TransportError::Rejected)
    }

    fn await_completion(&mut self, _timeout: Timeout) -> Result<Option<Message>, TransportError> {
        Err(TransportError::Rejected)
    }

    fn max_payload_size(&self) -> usize {
        self.pool.message_size()
    }

    fn is_local(&self) -> bool {
        true
    }
}
