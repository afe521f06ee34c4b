use crate::{
    memory_domain::{translate_to_local, translate_to_remote, AddressTranslator},
    message::{
        Message, MessageView, MessageWriter, WireDescriptor, BUFFER_LIST_WIRE_SIZE,
        DESCRIPTOR_WIRE_SIZE,
    },
    AccessHint, Address, BufferDescriptor, SparseBufferList, MAX_IO_BUFFERS,
};
use log::{trace, warn};
use remote_commons::{RemoteError, RemoteResult};

/// Check that the declared number of buffers matches the populated slots and that
/// every populated slot can go on the wire. All slots are scanned, not only up to
/// the declared count.
pub fn validate_list(list: &SparseBufferList) -> RemoteResult<()> {
    let found = list.count_populated();
    if list.num_bufs != found {
        return Err(RemoteError::MalformedBufferList {
            declared: list.num_bufs,
            found,
        });
    }
    for (slot, desc) in list.populated() {
        // callers hand in their own addresses, lengths travel as 32 bit
        if let Address::Remote(_) = desc.address {
            warn!("buffer in slot {} already carries a remote address", slot);
            return Err(RemoteError::InvalidArgument);
        }
        if u32::try_from(desc.size).is_err() {
            return Err(RemoteError::InvalidArgument);
        }
    }
    Ok(())
}

/// A caller list translated for the target domain, not yet written anywhere
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireBufferList {
    pub num_bufs: u32,
    pub descs: [WireDescriptor; MAX_IO_BUFFERS],
}

impl WireBufferList {
    pub fn translated(&self) -> usize {
        self.descs.iter().filter(|desc| desc.address != 0).count()
    }
}

/// Translate every populated slot without touching the caller's list.
/// Fails with the slot of the first descriptor that does not translate.
pub fn translate_buffer_list(
    translator: &dyn AddressTranslator,
    list: &SparseBufferList,
) -> RemoteResult<WireBufferList> {
    let mut descs = [WireDescriptor::default(); MAX_IO_BUFFERS];
    for (slot, desc) in list.populated() {
        if let Address::Remote(_) = desc.address {
            return Err(RemoteError::InvalidArgument);
        }
        let remote = translate_to_remote(translator, desc)
            .ok_or(RemoteError::TranslationFailed { slot })?;
        descs[slot] = to_wire(&remote)?;
    }
    Ok(WireBufferList {
        num_bufs: list.num_bufs as u32,
        descs,
    })
}

pub fn write_buffer_list(
    message: &mut Message,
    offset: usize,
    list: &WireBufferList,
) -> RemoteResult<()> {
    let mut writer = MessageWriter::new(message, offset);
    writer.put_u32(list.num_bufs)?;
    writer.put_u32(0)?;
    for desc in list.descs.iter() {
        writer.put_descriptor(desc)?;
    }
    debug_assert_eq!(offset + BUFFER_LIST_WIRE_SIZE, writer.position());
    Ok(())
}

/// Translate a list and write it into the message at offset.
/// Nothing is written and the caller's list is left as is if any slot fails to translate.
/// On success the access hints of the caller's descriptors are cleared, the caller
/// gives up the buffers until the reply arrives.
/// Returns the number of translated descriptors.
pub fn marshal_buffer_list(
    translator: &dyn AddressTranslator,
    list: &mut SparseBufferList,
    message: &mut Message,
    offset: usize,
) -> RemoteResult<usize> {
    let wire = translate_buffer_list(translator, list)?;
    write_buffer_list(message, offset, &wire)?;
    reset_access_hints(list);
    trace!("marshaled {} buffer descriptors at offset {}", wire.translated(), offset);
    Ok(wire.translated())
}

fn to_wire(desc: &BufferDescriptor) -> RemoteResult<WireDescriptor> {
    let address = match desc.address {
        Address::Remote(address) => address,
        Address::Local(_) => return Err(RemoteError::InvalidArgument),
    };
    let size = u32::try_from(desc.size).map_err(|_| RemoteError::InvalidArgument)?;
    Ok(WireDescriptor {
        address,
        size,
        access: desc.access.to_wire(),
    })
}

/// Read a list in target domain form, empty slots come back as `None`
pub fn decode_buffer_list<'a>(
    message: impl Into<MessageView<'a>>,
    offset: usize,
) -> RemoteResult<SparseBufferList> {
    let message = message.into();
    let num_bufs = message.read_u32(offset)? as usize;
    if num_bufs > MAX_IO_BUFFERS {
        return Err(RemoteError::MalformedMessage);
    }
    let mut list = SparseBufferList::new();
    list.num_bufs = num_bufs;
    for slot in 0..MAX_IO_BUFFERS {
        let wire = message.read_descriptor(offset + 8 + slot * DESCRIPTOR_WIRE_SIZE)?;
        if wire.address != 0 {
            list.descs[slot] = Some(BufferDescriptor {
                address: Address::Remote(wire.address),
                size: wire.size as usize,
                access: AccessHint::from_wire(wire.access),
            });
        }
    }
    Ok(list)
}

/// Write a target domain list back into the message, used by the skeleton for the reply
pub fn encode_remote_list(
    message: &mut Message,
    offset: usize,
    list: &SparseBufferList,
) -> RemoteResult<()> {
    let mut wire = WireBufferList {
        num_bufs: list.count_populated() as u32,
        descs: [WireDescriptor::default(); MAX_IO_BUFFERS],
    };
    for (slot, desc) in list.populated() {
        wire.descs[slot] = to_wire(desc)?;
    }
    write_buffer_list(message, offset, &wire)
}

/// Bring the output buffer list of a reply back to the caller.
///
/// The caller's addresses stay authoritative unless the algorithm class may hand
/// back its output buffers in a different order, then every returned descriptor
/// is translated back with the size it carries. Descriptors that do not translate
/// back leave their slot empty. Access hints are reset in both cases.
pub fn unmarshal_out_buffers<'a>(
    translator: &dyn AddressTranslator,
    message: impl Into<MessageView<'a>>,
    offset: usize,
    list: &mut SparseBufferList,
    reordered: bool,
) -> RemoteResult<()> {
    if reordered {
        let returned = decode_buffer_list(message, offset)?;
        for slot in 0..MAX_IO_BUFFERS {
            list.descs[slot] = match returned.descs[slot] {
                Some(remote) => {
                    let local = translate_to_local(translator, &remote);
                    if local.is_none() {
                        warn!(
                            "returned output buffer in slot {} could not be translated back",
                            slot
                        );
                    }
                    local
                }
                None => None,
            };
        }
        list.num_bufs = list.count_populated();
    }
    reset_access_hints(list);
    Ok(())
}

/// The caller did not touch any of the buffers while they were with the other domain
pub fn reset_access_hints(list: &mut SparseBufferList) {
    for desc in list.descs.iter_mut().flatten() {
        desc.access = AccessHint::None;
    }
}
