pub mod cache;
pub mod codec;
pub mod config;
pub mod memory_domain;
pub mod message;
pub mod skeleton;
pub mod stub;
pub mod transport;

#[cfg(any(test, feature = "test_export"))]
pub mod test_utils;

/// Number of slots in every sparse buffer descriptor list
pub const MAX_IO_BUFFERS: usize = 16;

/// Records how the owning domain last touched a buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccessHint {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
}

impl AccessHint {
    const READ: u32 = 0b01;
    const WRITE: u32 = 0b10;

    pub fn to_wire(self) -> u32 {
        match self {
            AccessHint::None => 0,
            AccessHint::Read => Self::READ,
            AccessHint::Write => Self::WRITE,
            AccessHint::ReadWrite => Self::READ | Self::WRITE,
        }
    }

    pub fn from_wire(mask: u32) -> Self {
        match (mask & Self::READ != 0, mask & Self::WRITE != 0) {
            (false, false) => AccessHint::None,
            (true, false) => AccessHint::Read,
            (false, true) => AccessHint::Write,
            (true, true) => AccessHint::ReadWrite,
        }
    }
}

/// Buffer address, tagged with the domain it is meaningful in.
/// `Local` addresses are virtual addresses of the calling domain,
/// `Remote` addresses are the tokens the target domain uses for the same memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Address {
    Local(usize),
    Remote(u64),
}

impl Address {
    pub fn is_null(&self) -> bool {
        match self {
            Address::Local(addr) => *addr == 0,
            Address::Remote(addr) => *addr == 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub address: Address,
    pub size: usize,
    pub access: AccessHint,
}

impl BufferDescriptor {
    pub fn local(address: usize, size: usize) -> Self {
        BufferDescriptor {
            address: Address::Local(address),
            size,
            access: AccessHint::None,
        }
    }

    pub fn remote(address: u64, size: usize) -> Self {
        BufferDescriptor {
            address: Address::Remote(address),
            size,
            access: AccessHint::None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }
}

/// Fixed capacity list of optional buffer descriptors.
/// Only `num_bufs` slots are expected to be populated, in any position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SparseBufferList {
    pub num_bufs: usize,
    pub descs: [Option<BufferDescriptor>; MAX_IO_BUFFERS],
}

impl Default for SparseBufferList {
    fn default() -> Self {
        SparseBufferList {
            num_bufs: 0,
            descs: [None; MAX_IO_BUFFERS],
        }
    }
}

impl SparseBufferList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a list from (slot, descriptor) pairs and declares the number of buffers given.
    /// Pairs with a slot outside the capacity are ignored.
    pub fn from_slots(slots: &[(usize, BufferDescriptor)]) -> Self {
        let mut list = Self::default();
        for (slot, desc) in slots {
            if *slot < MAX_IO_BUFFERS {
                list.descs[*slot] = Some(*desc);
            }
        }
        list.num_bufs = list.count_populated();
        list
    }

    /// Non-null descriptors in slot order
    pub fn populated(&self) -> impl Iterator<Item = (usize, &BufferDescriptor)> {
        self.descs
            .iter()
            .enumerate()
            .filter_map(|(slot, desc)| match desc {
                Some(desc) if !desc.is_null() => Some((slot, desc)),
                _ => None,
            })
    }

    pub fn count_populated(&self) -> usize {
        self.populated().count()
    }

    pub fn get(&self, slot: usize) -> Option<&BufferDescriptor> {
        self.descs.get(slot)?.as_ref().filter(|desc| !desc.is_null())
    }
}

/// Shape of the argument structures of one class of algorithms.
/// All sizes are the byte sizes of the base structures, every structure
/// starts with its 32 bit `size` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlgorithmClass {
    pub name: &'static str,
    pub in_args_base: usize,
    pub out_args_base: usize,
    pub dyn_params_base: usize,
    pub status_base: usize,
    /// offset of the buffer descriptor embedded in the status structure
    pub status_buffer: Option<usize>,
    /// offsets of buffer descriptors the algorithm reports through the out args
    pub out_args_buffers: &'static [usize],
    /// algorithm may hand back output buffers in a different order than it got them
    pub out_buffers_reordered: bool,
}

impl AlgorithmClass {
    /// Class without embedded buffers, only the size fields as base structures
    pub const fn minimal(name: &'static str) -> Self {
        AlgorithmClass {
            name,
            in_args_base: 4,
            out_args_base: 4,
            dyn_params_base: 4,
            status_base: 4,
            status_buffer: None,
            out_args_buffers: &[],
            out_buffers_reordered: false,
        }
    }
}
