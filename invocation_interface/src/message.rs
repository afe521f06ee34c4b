//! Messages exchanged between the stub and the skeleton.
//!
//! All fields are little endian. A message starts with the envelope
//! `{ command: u32, status: i32 }`, followed by the command specific region:
//!
//! ```text
//! PROCESS: in buffer list | out buffer list | in args (in_args.size) | out args (out_args.size)
//! CONTROL: command id: i32 | dynamic params (params.size) | status (status.size)
//! ```
//!
//! A buffer list is `{ num_bufs: u32, reserved: u32 }` followed by
//! [`MAX_IO_BUFFERS`] descriptors of `{ address: u64, size: u32, access: u32 }`.
//! The second extensible structure of each command starts right after the
//! first one, at an offset given by the first one's size field.

use crate::MAX_IO_BUFFERS;
use crossbeam::queue::ArrayQueue;
use remote_commons::{AlgStatus, RemoteError, RemoteResult};
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

pub const ENVELOPE_SIZE: usize = 8;
pub const DESCRIPTOR_WIRE_SIZE: usize = 16;
pub const BUFFER_LIST_WIRE_SIZE: usize = 8 + MAX_IO_BUFFERS * DESCRIPTOR_WIRE_SIZE;
pub const IN_BUFS_OFFSET: usize = ENVELOPE_SIZE;
pub const OUT_BUFS_OFFSET: usize = IN_BUFS_OFFSET + BUFFER_LIST_WIRE_SIZE;
pub const IN_ARGS_OFFSET: usize = OUT_BUFS_OFFSET + BUFFER_LIST_WIRE_SIZE;
pub const CONTROL_ID_OFFSET: usize = ENVELOPE_SIZE;
pub const CONTROL_PARAMS_OFFSET: usize = CONTROL_ID_OFFSET + 4;
/// Every extensible structure starts with its own size
pub const SIZE_FIELD: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Process = 0,
    Control = 1,
}

impl Command {
    pub fn from_wire(value: u32) -> Option<Command> {
        match value {
            0 => Some(Command::Process),
            1 => Some(Command::Control),
            _ => None,
        }
    }
}

/// Message size needed for a process call with the given argument sizes
pub fn process_message_size(in_args_size: usize, out_args_size: usize) -> usize {
    IN_ARGS_OFFSET
        .saturating_add(in_args_size)
        .saturating_add(out_args_size)
}

/// Message size needed for a control call with the given argument sizes
pub fn control_message_size(params_size: usize, status_size: usize) -> usize {
    CONTROL_PARAMS_OFFSET
        .saturating_add(params_size)
        .saturating_add(status_size)
}

/// Buffer descriptor as it is laid out in a message or argument structure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WireDescriptor {
    pub address: u64,
    pub size: u32,
    pub access: u32,
}

impl WireDescriptor {
    pub fn decode(bytes: &[u8]) -> Option<WireDescriptor> {
        let bytes = bytes.get(..DESCRIPTOR_WIRE_SIZE)?;
        Some(WireDescriptor {
            address: u64::from_le_bytes(bytes[0..8].try_into().ok()?),
            size: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            access: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }

    pub fn encode(&self, bytes: &mut [u8]) -> Option<()> {
        let bytes = bytes.get_mut(..DESCRIPTOR_WIRE_SIZE)?;
        bytes[0..8].copy_from_slice(&self.address.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.access.to_le_bytes());
        Some(())
    }
}

struct PoolInner {
    free: ArrayQueue<Box<[u8]>>,
    message_size: usize,
    allocations: AtomicUsize,
    outstanding: AtomicUsize,
}

/// Fixed number of fixed size messages.
/// Exhaustion is reported to the caller, allocation never blocks.
#[derive(Clone)]
pub struct MessagePool {
    inner: Arc<PoolInner>,
}

impl MessagePool {
    pub fn new(count: usize, message_size: usize) -> Self {
        let free = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let _ = free.push(vec![0u8; message_size].into_boxed_slice());
        }
        MessagePool {
            inner: Arc::new(PoolInner {
                free,
                message_size,
                allocations: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn allocate(&self) -> Option<Message> {
        let mut buffer = self.inner.free.pop()?;
        buffer.fill(0);
        self.inner.allocations.fetch_add(1, Ordering::AcqRel);
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Some(Message {
            buffer,
            pool: self.inner.clone(),
        })
    }

    /// Return a message, equivalent to dropping it
    pub fn free(&self, message: Message) {
        drop(message);
    }

    pub fn message_size(&self) -> usize {
        self.inner.message_size
    }

    /// Number of successful allocations over the lifetime of the pool
    pub fn allocations(&self) -> usize {
        self.inner.allocations.load(Ordering::Acquire)
    }

    /// Messages currently allocated and not yet returned
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.inner.free.len()
    }
}

/// A message owned by exactly one side at a time, returned to its pool when dropped
pub struct Message {
    buffer: Box<[u8]>,
    pool: Arc<PoolInner>,
}

impl Drop for Message {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.pool.free.push(buffer).is_err() {
            log::error!("message returned to a pool that is already full");
        }
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("command", &self.command_raw())
            .field("status", &self.status())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Message {
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Read only view of the whole message
    pub fn view(&self) -> MessageView<'_> {
        MessageView::new(&self.buffer)
    }

    pub fn command_raw(&self) -> u32 {
        self.view().command_raw()
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_wire(self.command_raw())
    }

    pub fn set_command(&mut self, command: Command) {
        self.set_command_raw(command as u32);
    }

    pub fn set_command_raw(&mut self, command: u32) {
        let _ = self.write_u32(0, command);
    }

    pub fn status(&self) -> AlgStatus {
        self.view().status()
    }

    pub fn set_status(&mut self, status: AlgStatus) {
        let _ = self.write_i32(4, status);
    }

    /// Zero everything after the envelope
    pub fn clear_payload(&mut self) {
        if let Some(payload) = self.buffer.get_mut(ENVELOPE_SIZE..) {
            payload.fill(0);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn slice(&self, range: Range<usize>) -> RemoteResult<&[u8]> {
        self.view().slice(range)
    }

    pub fn slice_mut(&mut self, range: Range<usize>) -> RemoteResult<&mut [u8]> {
        self.buffer.get_mut(range).ok_or(RemoteError::MalformedMessage)
    }

    /// Two regions of the message, the first read only, the second writable.
    /// The first region has to end before the second one starts.
    pub fn split_regions(
        &mut self,
        first: Range<usize>,
        second: Range<usize>,
    ) -> RemoteResult<(&[u8], &mut [u8])> {
        if first.start > first.end || first.end > second.start || second.end > self.buffer.len() {
            return Err(RemoteError::MalformedMessage);
        }
        let (head, tail) = self.buffer.split_at_mut(second.start);
        let first_region = &head[first];
        let second_region = &mut tail[..second.end - second.start];
        Ok((first_region, second_region))
    }

    pub fn read_u32(&self, offset: usize) -> RemoteResult<u32> {
        self.view().read_u32(offset)
    }

    pub fn read_i32(&self, offset: usize) -> RemoteResult<i32> {
        self.view().read_i32(offset)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> RemoteResult<()> {
        self.slice_mut(offset..offset.saturating_add(4))?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) -> RemoteResult<()> {
        self.write_u32(offset, value as u32)
    }

    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> RemoteResult<()> {
        self.slice_mut(offset..offset.saturating_add(data.len()))?
            .copy_from_slice(data);
        Ok(())
    }

    pub fn read_descriptor(&self, offset: usize) -> RemoteResult<WireDescriptor> {
        self.view().read_descriptor(offset)
    }

    pub fn write_descriptor(&mut self, offset: usize, desc: &WireDescriptor) -> RemoteResult<()> {
        desc.encode(self.slice_mut(offset..offset.saturating_add(DESCRIPTOR_WIRE_SIZE))?)
            .ok_or(RemoteError::MalformedMessage)
    }

    /// Size field of the extensible structure starting at offset
    pub fn read_size_field(&self, offset: usize) -> RemoteResult<usize> {
        self.view().read_size_field(offset)
    }
}

/// Reading side of a message, over a live message or bytes copied out of one
#[derive(Clone, Copy)]
pub struct MessageView<'a> {
    bytes: &'a [u8],
}

impl<'a> MessageView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        MessageView { bytes }
    }

    pub fn command_raw(&self) -> u32 {
        self.read_u32(0).unwrap_or(u32::MAX)
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_wire(self.command_raw())
    }

    pub fn status(&self) -> AlgStatus {
        self.read_i32(4).unwrap_or(remote_commons::EFAIL)
    }

    pub fn slice(&self, range: Range<usize>) -> RemoteResult<&'a [u8]> {
        self.bytes.get(range).ok_or(RemoteError::MalformedMessage)
    }

    pub fn read_u32(&self, offset: usize) -> RemoteResult<u32> {
        let bytes = self.slice(offset..offset.saturating_add(4))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&self, offset: usize) -> RemoteResult<i32> {
        self.read_u32(offset).map(|value| value as i32)
    }

    pub fn read_descriptor(&self, offset: usize) -> RemoteResult<WireDescriptor> {
        WireDescriptor::decode(self.slice(offset..offset.saturating_add(DESCRIPTOR_WIRE_SIZE))?)
            .ok_or(RemoteError::MalformedMessage)
    }

    pub fn read_size_field(&self, offset: usize) -> RemoteResult<usize> {
        self.read_u32(offset).map(|size| size as usize)
    }
}

impl<'a> From<&'a Message> for MessageView<'a> {
    fn from(message: &'a Message) -> Self {
        message.view()
    }
}

/// Writes consecutive fields into a message, keeping track of the position
pub struct MessageWriter<'a> {
    message: &'a mut Message,
    cursor: usize,
}

impl<'a> MessageWriter<'a> {
    pub fn new(message: &'a mut Message, offset: usize) -> Self {
        MessageWriter {
            message,
            cursor: offset,
        }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn put_u32(&mut self, value: u32) -> RemoteResult<()> {
        self.message.write_u32(self.cursor, value)?;
        self.cursor += 4;
        Ok(())
    }

    pub fn put_i32(&mut self, value: i32) -> RemoteResult<()> {
        self.put_u32(value as u32)
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> RemoteResult<()> {
        self.message.write_bytes(self.cursor, data)?;
        self.cursor += data.len();
        Ok(())
    }

    pub fn put_descriptor(&mut self, desc: &WireDescriptor) -> RemoteResult<()> {
        self.message.write_descriptor(self.cursor, desc)?;
        self.cursor += DESCRIPTOR_WIRE_SIZE;
        Ok(())
    }

    /// Leave a region of the given size untouched
    pub fn skip(&mut self, size: usize) -> RemoteResult<()> {
        let end = self.cursor.saturating_add(size);
        if end > self.message.capacity() {
            return Err(RemoteError::MalformedMessage);
        }
        self.cursor = end;
        Ok(())
    }
}

/// Where the two extensible structures of a process message live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessLayout {
    pub in_args: Range<usize>,
    pub out_args: Range<usize>,
}

impl ProcessLayout {
    pub fn new(in_args_size: usize, out_args_size: usize) -> Self {
        let out_args_start = IN_ARGS_OFFSET + in_args_size;
        ProcessLayout {
            in_args: IN_ARGS_OFFSET..out_args_start,
            out_args: out_args_start..out_args_start + out_args_size,
        }
    }

    /// Layout as declared by the size fields inside the message
    pub fn locate(message: &Message) -> RemoteResult<Self> {
        let in_args_size = message.read_size_field(IN_ARGS_OFFSET)?;
        let out_args_size = message.read_size_field(IN_ARGS_OFFSET.saturating_add(in_args_size))?;
        check_declared(message, IN_ARGS_OFFSET, in_args_size, out_args_size)?;
        Ok(Self::new(in_args_size, out_args_size))
    }
}

/// Where the two extensible structures of a control message live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlLayout {
    pub params: Range<usize>,
    pub status: Range<usize>,
}

impl ControlLayout {
    pub fn new(params_size: usize, status_size: usize) -> Self {
        let status_start = CONTROL_PARAMS_OFFSET + params_size;
        ControlLayout {
            params: CONTROL_PARAMS_OFFSET..status_start,
            status: status_start..status_start + status_size,
        }
    }

    pub fn locate(message: &Message) -> RemoteResult<Self> {
        let params_size = message.read_size_field(CONTROL_PARAMS_OFFSET)?;
        let status_size =
            message.read_size_field(CONTROL_PARAMS_OFFSET.saturating_add(params_size))?;
        check_declared(message, CONTROL_PARAMS_OFFSET, params_size, status_size)?;
        Ok(Self::new(params_size, status_size))
    }
}

fn check_declared(
    message: &Message,
    start: usize,
    first_size: usize,
    second_size: usize,
) -> RemoteResult<()> {
    if first_size < SIZE_FIELD || second_size < SIZE_FIELD {
        return Err(RemoteError::MalformedMessage);
    }
    let end = start
        .checked_add(first_size)
        .and_then(|end| end.checked_add(second_size))
        .ok_or(RemoteError::MalformedMessage)?;
    if end > message.capacity() {
        return Err(RemoteError::MalformedMessage);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_accounting() {
        let pool = MessagePool::new(2, 64);
        let first = pool.allocate().expect("pool should have a message");
        let second = pool.allocate().expect("pool should have a second message");
        assert!(pool.allocate().is_none());
        assert_eq!(2, pool.allocations());
        assert_eq!(2, pool.outstanding());
        pool.free(first);
        drop(second);
        assert_eq!(0, pool.outstanding());
        assert_eq!(2, pool.available());
        let third = pool.allocate().expect("returned messages are reusable");
        assert_eq!(64, third.capacity());
        assert_eq!(3, pool.allocations());
    }

    #[test]
    fn empty_pool_never_allocates() {
        let pool = MessagePool::new(0, 64);
        assert!(pool.allocate().is_none());
        assert_eq!(0, pool.allocations());
    }

    #[test]
    fn reused_message_is_zeroed() {
        let pool = MessagePool::new(1, 32);
        let mut message = pool.allocate().unwrap();
        message.set_command(Command::Control);
        message.set_status(-1);
        message.write_bytes(8, &[0xff; 24]).unwrap();
        drop(message);
        let message = pool.allocate().unwrap();
        assert!(message.as_bytes().iter().all(|byte| *byte == 0));
        assert_eq!(Some(Command::Process), message.command());
    }

    #[test]
    fn envelope_fields() {
        let pool = MessagePool::new(1, 16);
        let mut message = pool.allocate().unwrap();
        message.set_command(Command::Control);
        message.set_status(-3);
        assert_eq!(Some(Command::Control), message.command());
        assert_eq!(-3, message.status());
        message.set_command_raw(9);
        assert_eq!(None, message.command());
        assert_eq!(Err(RemoteError::MalformedMessage), message.read_u32(14));
    }

    #[test]
    fn writer_tracks_cursor() {
        let pool = MessagePool::new(1, 64);
        let mut message = pool.allocate().unwrap();
        let mut writer = MessageWriter::new(&mut message, ENVELOPE_SIZE);
        writer.put_u32(7).unwrap();
        writer.skip(4).unwrap();
        writer
            .put_descriptor(&WireDescriptor {
                address: 0x8000_1000,
                size: 64,
                access: 0,
            })
            .unwrap();
        assert_eq!(ENVELOPE_SIZE + 8 + DESCRIPTOR_WIRE_SIZE, writer.position());
        assert_eq!(Err(RemoteError::MalformedMessage), writer.skip(64));
        assert_eq!(7, message.read_u32(ENVELOPE_SIZE).unwrap());
        assert_eq!(0x8000_1000, message.read_descriptor(16).unwrap().address);
    }

    #[test]
    fn process_layout_follows_size_fields() {
        let pool = MessagePool::new(1, 1024);
        let mut message = pool.allocate().unwrap();
        message.write_u32(IN_ARGS_OFFSET, 20).unwrap();
        message.write_u32(IN_ARGS_OFFSET + 20, 24).unwrap();
        let layout = ProcessLayout::locate(&message).unwrap();
        assert_eq!(ProcessLayout::new(20, 24), layout);
        assert_eq!(IN_ARGS_OFFSET + 20, layout.out_args.start);
        assert_eq!(process_message_size(20, 24), layout.out_args.end);
    }

    #[test]
    fn layout_rejects_sizes_past_capacity() {
        let pool = MessagePool::new(1, 128);
        let mut message = pool.allocate().unwrap();
        message.write_u32(CONTROL_PARAMS_OFFSET, 8).unwrap();
        message.write_u32(CONTROL_PARAMS_OFFSET + 8, 200).unwrap();
        assert_eq!(
            Err(RemoteError::MalformedMessage),
            ControlLayout::locate(&message)
        );
        message.write_u32(CONTROL_PARAMS_OFFSET + 8, 0).unwrap();
        assert_eq!(
            Err(RemoteError::MalformedMessage),
            ControlLayout::locate(&message)
        );
        message.write_u32(CONTROL_PARAMS_OFFSET + 8, 16).unwrap();
        assert_eq!(ControlLayout::new(8, 16), ControlLayout::locate(&message).unwrap());
    }

    #[test]
    fn split_regions_requires_order() {
        let pool = MessagePool::new(1, 64);
        let mut message = pool.allocate().unwrap();
        assert!(message.split_regions(20..30, 10..20).is_err());
        assert!(message.split_regions(10..20, 20..80).is_err());
        let (first, second) = message.split_regions(10..20, 20..30).unwrap();
        assert_eq!(10, first.len());
        second[0] = 1;
        assert_eq!(1, message.as_bytes()[20]);
    }
}
