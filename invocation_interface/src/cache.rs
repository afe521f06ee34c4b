use crate::{Address, BufferDescriptor, SparseBufferList};
use serde::Deserialize;
use std::sync::{
    atomic::{fence, Ordering},
    Arc,
};

/// When buffers are made coherent around an invocation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum CachePolicy {
    /// caller and callee share a coherent cache domain
    None,
    /// whole cache write back and invalidate around the invocation
    FullInvalidateFullWriteback,
    /// invalidate every input and output buffer before, write back output buffers after
    #[default]
    PerBufferInvalidateWriteback,
}

/// Cache maintenance operations of the target domain, addresses are remote addresses
pub trait CacheController: Send + Sync {
    fn invalidate(&self, address: u64, size: usize);
    fn writeback(&self, address: u64, size: usize);
    fn writeback_invalidate_all(&self);
}

/// Cache controller for domains on the same coherent host.
/// Maintenance reduces to ordering the buffer accesses against the message exchange.
#[derive(Debug, Default)]
pub struct HostCache {}

impl CacheController for HostCache {
    fn invalidate(&self, _address: u64, _size: usize) {
        fence(Ordering::Acquire);
    }
    fn writeback(&self, _address: u64, _size: usize) {
        fence(Ordering::Release);
    }
    fn writeback_invalidate_all(&self) {
        fence(Ordering::SeqCst);
    }
}

fn remote_range(desc: &BufferDescriptor) -> Option<(u64, usize)> {
    match desc.address {
        Address::Remote(address) if address != 0 => Some((address, desc.size)),
        _ => None,
    }
}

/// Policy bound to the controller that executes it, owned by the skeleton
#[derive(Clone)]
pub struct CoherencePolicy {
    policy: CachePolicy,
    controller: Arc<dyn CacheController>,
}

impl CoherencePolicy {
    pub fn new(policy: CachePolicy, controller: Arc<dyn CacheController>) -> Self {
        CoherencePolicy { policy, controller }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Make the caller's writes visible and drop stale lines of buffers about to be overwritten
    pub fn before_invocation(&self, in_bufs: &SparseBufferList, out_bufs: &SparseBufferList) {
        match self.policy {
            CachePolicy::None => (),
            CachePolicy::FullInvalidateFullWriteback => self.controller.writeback_invalidate_all(),
            CachePolicy::PerBufferInvalidateWriteback => {
                for (_, desc) in in_bufs.populated().chain(out_bufs.populated()) {
                    if let Some((address, size)) = remote_range(desc) {
                        self.controller.invalidate(address, size);
                    }
                }
            }
        }
    }

    /// Make the callee's writes to the output buffers visible to the caller
    pub fn after_invocation(&self, out_bufs: &SparseBufferList) {
        match self.policy {
            CachePolicy::None => (),
            CachePolicy::FullInvalidateFullWriteback => self.controller.writeback_invalidate_all(),
            CachePolicy::PerBufferInvalidateWriteback => {
                for (_, desc) in out_bufs.populated() {
                    if let Some((address, size)) = remote_range(desc) {
                        self.controller.writeback(address, size);
                    }
                }
            }
        }
    }

    pub fn before_control(&self, status_buffer: Option<&BufferDescriptor>) {
        match (self.policy, status_buffer.and_then(remote_range)) {
            (CachePolicy::PerBufferInvalidateWriteback, Some((address, size))) => {
                self.controller.invalidate(address, size)
            }
            (CachePolicy::FullInvalidateFullWriteback, _) => {
                self.controller.writeback_invalidate_all()
            }
            _ => (),
        }
    }

    pub fn after_control(&self, status_buffer: Option<&BufferDescriptor>) {
        match (self.policy, status_buffer.and_then(remote_range)) {
            (CachePolicy::PerBufferInvalidateWriteback, Some((address, size))) => {
                self.controller.writeback(address, size)
            }
            (CachePolicy::FullInvalidateFullWriteback, _) => {
                self.controller.writeback_invalidate_all()
            }
            _ => (),
        }
    }
}
