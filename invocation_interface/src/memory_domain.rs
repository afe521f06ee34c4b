// list of memory domain implementations
pub mod identity;
pub mod shared;

use crate::{Address, BufferDescriptor};
use remote_commons::RemoteResult;

/// Converts buffer addresses between the calling domain and the target domain.
/// Both directions take the length of the buffer, a buffer is only translatable
/// if the whole range is mapped in the destination domain.
pub trait AddressTranslator: Send + Sync {
    fn to_remote(&self, local: usize, size: usize) -> Option<u64>;
    fn to_local(&self, remote: u64, size: usize) -> Option<usize>;
}

/// Access to buffer memory by remote address, used by algorithms on the target side
pub trait RemoteMemory: Send + Sync {
    fn read(&self, remote: u64, size: usize) -> RemoteResult<Vec<u8>>;
    fn write(&self, remote: u64, data: &[u8]) -> RemoteResult<()>;
}

/// Translate a caller side descriptor for transfer, the access hint is not carried over
pub fn translate_to_remote(
    translator: &dyn AddressTranslator,
    desc: &BufferDescriptor,
) -> Option<BufferDescriptor> {
    match desc.address {
        Address::Local(local) if local != 0 => translator
            .to_remote(local, desc.size)
            .map(|remote| BufferDescriptor::remote(remote, desc.size)),
        _ => None,
    }
}

/// Translate a descriptor handed back by the target domain, using the size it carries
pub fn translate_to_local(
    translator: &dyn AddressTranslator,
    desc: &BufferDescriptor,
) -> Option<BufferDescriptor> {
    match desc.address {
        Address::Remote(remote) if remote != 0 => translator
            .to_local(remote, desc.size)
            .map(|local| BufferDescriptor::local(local, desc.size)),
        _ => None,
    }
}
