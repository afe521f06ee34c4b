use crate::message::{Message, WireDescriptor, DESCRIPTOR_WIRE_SIZE, SIZE_FIELD};
use remote_commons::{RemoteError, RemoteResult};

fn read_u32_at(bytes: &[u8], offset: usize, err: RemoteError) -> RemoteResult<u32> {
    let field = bytes.get(offset..offset.saturating_add(4)).ok_or(err)?;
    Ok(u32::from_le_bytes([field[0], field[1], field[2], field[3]]))
}

fn write_u32_at(bytes: &mut [u8], offset: usize, value: u32) -> RemoteResult<()> {
    bytes
        .get_mut(offset..offset.saturating_add(4))
        .ok_or(RemoteError::InvalidWrite)?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn read_descriptor_at(bytes: &[u8], offset: usize) -> RemoteResult<WireDescriptor> {
    bytes
        .get(offset..offset.saturating_add(DESCRIPTOR_WIRE_SIZE))
        .and_then(WireDescriptor::decode)
        .ok_or(RemoteError::InvalidRead)
}

fn write_descriptor_at(bytes: &mut [u8], offset: usize, desc: &WireDescriptor) -> RemoteResult<()> {
    bytes
        .get_mut(offset..offset.saturating_add(DESCRIPTOR_WIRE_SIZE))
        .and_then(|field| desc.encode(field))
        .ok_or(RemoteError::InvalidWrite)
}

/// Caller side extensible argument structure.
/// The first four bytes hold the declared size, the backing storage may be larger
/// than the declared size but never smaller for a valid structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensibleArgs {
    bytes: Vec<u8>,
}

impl ExtensibleArgs {
    /// Zeroed structure with its size field set
    pub fn new(size: usize) -> Self {
        let mut bytes = vec![0u8; size.max(SIZE_FIELD)];
        bytes[..SIZE_FIELD].copy_from_slice(&(size as u32).to_le_bytes());
        ExtensibleArgs { bytes }
    }

    /// Takes raw bytes as they are, including whatever size field they carry
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        if bytes.len() < SIZE_FIELD {
            bytes.resize(SIZE_FIELD, 0);
        }
        ExtensibleArgs { bytes }
    }

    /// Declared size
    pub fn size(&self) -> usize {
        read_u32_at(&self.bytes, 0, RemoteError::InvalidRead).unwrap_or(0) as usize
    }

    pub fn set_size(&mut self, size: usize) {
        let _ = write_u32_at(&mut self.bytes, 0, size as u32);
    }

    /// Backing storage, independent of the declared size
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Bytes covered by the declared size, clamped to the storage
    pub fn declared(&self) -> &[u8] {
        let end = self.size().min(self.bytes.len());
        &self.bytes[..end]
    }

    pub fn view(&self) -> ArgsRef<'_> {
        ArgsRef::new(self.declared())
    }

    pub fn view_mut(&mut self) -> ArgsMut<'_> {
        let end = self.size().min(self.bytes.len());
        ArgsMut::new(&mut self.bytes[..end])
    }

    pub fn read_u32(&self, offset: usize) -> RemoteResult<u32> {
        self.view().read_u32(offset)
    }

    pub fn read_i32(&self, offset: usize) -> RemoteResult<i32> {
        self.view().read_i32(offset)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> RemoteResult<()> {
        self.view_mut().write_u32(offset, value)
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) -> RemoteResult<()> {
        self.view_mut().write_i32(offset, value)
    }

    pub fn read_descriptor(&self, offset: usize) -> RemoteResult<WireDescriptor> {
        self.view().read_descriptor(offset)
    }

    pub fn write_descriptor(&mut self, offset: usize, desc: &WireDescriptor) -> RemoteResult<()> {
        self.view_mut().write_descriptor(offset, desc)
    }

    /// Zero everything after the size field
    pub fn scrub(&mut self) {
        let end = self.size().min(self.bytes.len());
        if end > SIZE_FIELD {
            self.bytes[SIZE_FIELD..end].fill(0);
        }
    }
}

/// Read only view of an extensible structure inside a message
#[derive(Clone, Copy, Debug)]
pub struct ArgsRef<'a> {
    bytes: &'a [u8],
}

impl<'a> ArgsRef<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ArgsRef { bytes }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn read_u32(&self, offset: usize) -> RemoteResult<u32> {
        read_u32_at(self.bytes, offset, RemoteError::InvalidRead)
    }

    pub fn read_i32(&self, offset: usize) -> RemoteResult<i32> {
        self.read_u32(offset).map(|value| value as i32)
    }

    pub fn read_descriptor(&self, offset: usize) -> RemoteResult<WireDescriptor> {
        read_descriptor_at(self.bytes, offset)
    }
}

/// Writable view of an extensible structure inside a message
#[derive(Debug)]
pub struct ArgsMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> ArgsMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        ArgsMut { bytes }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    pub fn read_u32(&self, offset: usize) -> RemoteResult<u32> {
        read_u32_at(self.bytes, offset, RemoteError::InvalidRead)
    }

    pub fn read_i32(&self, offset: usize) -> RemoteResult<i32> {
        self.read_u32(offset).map(|value| value as i32)
    }

    pub fn read_descriptor(&self, offset: usize) -> RemoteResult<WireDescriptor> {
        read_descriptor_at(self.bytes, offset)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> RemoteResult<()> {
        write_u32_at(self.bytes, offset, value)
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) -> RemoteResult<()> {
        self.write_u32(offset, value as u32)
    }

    pub fn write_descriptor(&mut self, offset: usize, desc: &WireDescriptor) -> RemoteResult<()> {
        write_descriptor_at(self.bytes, offset, desc)
    }

    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> RemoteResult<()> {
        self.bytes
            .get_mut(offset..offset.saturating_add(data.len()))
            .ok_or(RemoteError::InvalidWrite)?
            .copy_from_slice(data);
        Ok(())
    }
}

/// Check the declared size against the base size of the structure and its storage
pub fn validate(args: &ExtensibleArgs, base_size: usize) -> RemoteResult<usize> {
    let size = args.size();
    if size < SIZE_FIELD || size < base_size || size > args.as_bytes().len() {
        return Err(RemoteError::InvalidArgument);
    }
    Ok(size)
}

/// Copy the declared bytes of the structure into the message, returns the offset after it
pub fn marshal_args(message: &mut Message, offset: usize, args: &ExtensibleArgs) -> RemoteResult<usize> {
    let declared = args.declared();
    message.write_bytes(offset, declared)?;
    Ok(offset + declared.len())
}

/// Reserve the region of a callee produced structure, only the size field is transferred
pub fn marshal_size_only(message: &mut Message, offset: usize, args: &ExtensibleArgs) -> RemoteResult<usize> {
    let size = args.size();
    message.write_u32(offset, size as u32)?;
    let end = offset.saturating_add(size);
    if end > message.capacity() {
        return Err(RemoteError::MalformedMessage);
    }
    Ok(end)
}

/// Copy a structure out of a message region into the caller's structure.
/// At most the caller's declared size is copied and the caller's size field is kept.
pub fn unmarshal_args(region: &[u8], dst: &mut ExtensibleArgs) -> RemoteResult<()> {
    let size = dst.size().min(dst.as_bytes().len());
    let copy_end = size.min(region.len());
    if copy_end > SIZE_FIELD {
        dst.as_bytes_mut()[SIZE_FIELD..copy_end].copy_from_slice(&region[SIZE_FIELD..copy_end]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePool;

    #[test]
    fn new_sets_size_field() {
        let args = ExtensibleArgs::new(20);
        assert_eq!(20, args.size());
        assert_eq!(20, args.as_bytes().len());
        assert_eq!(Ok(20), validate(&args, 8));
        assert_eq!(Err(RemoteError::InvalidArgument), validate(&args, 24));
    }

    #[test]
    fn validate_rejects_size_past_storage() {
        let mut args = ExtensibleArgs::new(8);
        args.set_size(12);
        assert_eq!(Err(RemoteError::InvalidArgument), validate(&args, 4));
        args.set_size(2);
        assert_eq!(Err(RemoteError::InvalidArgument), validate(&args, 0));
        let short = ExtensibleArgs::from_bytes(vec![]);
        assert_eq!(0, short.size());
    }

    #[test]
    fn round_trip_keeps_caller_fields() {
        let pool = MessagePool::new(1, 128);
        let mut message = pool.allocate().unwrap();
        let mut args = ExtensibleArgs::new(20);
        args.write_u32(4, 0xdead_beef).unwrap();
        args.write_i32(16, -7).unwrap();
        let end = marshal_args(&mut message, 8, &args).unwrap();
        assert_eq!(28, end);

        let mut copy = ExtensibleArgs::new(20);
        unmarshal_args(message.slice(8..end).unwrap(), &mut copy).unwrap();
        assert_eq!(args, copy);
    }

    #[test]
    fn unmarshal_keeps_size_field_and_clamps() {
        let mut region = vec![0xaa; 32];
        region[..4].copy_from_slice(&64u32.to_le_bytes());
        let mut dst = ExtensibleArgs::new(12);
        unmarshal_args(&region, &mut dst).unwrap();
        assert_eq!(12, dst.size());
        assert_eq!(&[0xaa; 8], &dst.as_bytes()[4..12]);
    }

    #[test]
    fn size_only_marshal_reserves_region() {
        let pool = MessagePool::new(1, 64);
        let mut message = pool.allocate().unwrap();
        let mut out_args = ExtensibleArgs::new(24);
        out_args.write_u32(8, 77).unwrap();
        assert_eq!(Ok(32), marshal_size_only(&mut message, 8, &out_args));
        assert_eq!(24, message.read_u32(8).unwrap());
        assert_eq!(0, message.read_u32(16).unwrap());
        let oversized = ExtensibleArgs::new(60);
        assert_eq!(
            Err(RemoteError::MalformedMessage),
            marshal_size_only(&mut message, 8, &oversized)
        );
    }

    #[test]
    fn scrub_clears_payload_only() {
        let mut args = ExtensibleArgs::from_bytes(vec![0xff; 16]);
        args.set_size(12);
        args.scrub();
        assert_eq!(12, args.size());
        assert_eq!(&[0u8; 8], &args.as_bytes()[4..12]);
        assert_eq!(&[0xff; 4], &args.as_bytes()[12..16]);
    }

    #[test]
    fn views_check_bounds() {
        let mut args = ExtensibleArgs::new(28);
        let desc = WireDescriptor {
            address: 0x1000,
            size: 64,
            access: 0,
        };
        args.write_descriptor(12, &desc).unwrap();
        assert_eq!(Ok(desc), args.read_descriptor(12));
        assert_eq!(Err(RemoteError::InvalidRead), args.read_descriptor(16));
        assert_eq!(Err(RemoteError::InvalidWrite), args.write_u32(26, 1));
        let mut bytes = vec![0u8; 8];
        let mut view = ArgsMut::new(&mut bytes);
        view.write_bytes(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(Err(RemoteError::InvalidWrite), view.write_bytes(6, &[1, 2, 3]));
        assert_eq!(0x0403_0201, ArgsRef::new(&bytes).read_u32(4).unwrap());
    }
}
