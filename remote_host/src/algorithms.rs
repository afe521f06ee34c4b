//! Sample algorithm served by the host.
//!
//! The copy algorithm moves bytes from every input buffer into the output
//! buffer of the same slot. Its argument structures:
//!
//! ```text
//! InArgs        { size, num_bytes }                                       8 bytes
//! OutArgs       { size, extended_error, bytes_generated, last_buf: desc } 28 bytes
//! DynamicParams { size, chunk_size }                                      8 bytes
//! Status        { size, extended_error, bytes_processed, reserved, data: desc } 32 bytes
//! ```

use invocation_interface::{
    codec::ArgsMut,
    message::WireDescriptor,
    skeleton::{remote_buffers, Algorithm, ControlCall, ProcessCall},
    AlgorithmClass, Address,
};
use log::{debug, trace};
use remote_commons::{AlgStatus, RemoteResult, EFAIL, EOK};

pub const IN_NUM_BYTES: usize = 4;
pub const OUT_EXTENDED_ERROR: usize = 4;
pub const OUT_BYTES_GENERATED: usize = 8;
pub const OUT_LAST_BUFFER: usize = 12;
pub const PARAMS_CHUNK_SIZE: usize = 4;
pub const STATUS_EXTENDED_ERROR: usize = 4;
pub const STATUS_BYTES_PROCESSED: usize = 8;
pub const STATUS_DATA: usize = 16;

pub const COPY_CLASS: AlgorithmClass = AlgorithmClass {
    name: "copy",
    in_args_base: 8,
    out_args_base: 28,
    dyn_params_base: 8,
    status_base: 32,
    status_buffer: Some(STATUS_DATA),
    out_args_buffers: &[OUT_LAST_BUFFER],
    out_buffers_reordered: false,
};

// control commands
pub const GETSTATUS: i32 = 0;
pub const SETPARAMS: i32 = 1;
pub const RESET: i32 = 2;
pub const GETVERSION: i32 = 6;

// extended error bits
pub const ERR_NO_BUFFERS: u32 = 1 << 0;
pub const ERR_MISSING_OUTPUT: u32 = 1 << 1;
pub const ERR_MEMORY: u32 = 1 << 2;
pub const ERR_UNSUPPORTED_COMMAND: u32 = 1 << 3;

pub const VERSION: &str = concat!("copy ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Default)]
pub struct CopyAlgorithm {
    bytes_processed: u64,
    /// most bytes copied per buffer and call, 0 for no limit
    chunk_size: usize,
}

impl CopyAlgorithm {
    pub fn new() -> Self {
        Self::default()
    }

    fn copy_buffers(&mut self, call: &mut ProcessCall<'_>) -> Result<(usize, Option<WireDescriptor>), u32> {
        let requested = call.in_args.read_u32(IN_NUM_BYTES).map_err(|_| ERR_NO_BUFFERS)? as usize;
        let mut remaining = requested;
        let mut last = None;
        let mut copied_any = false;
        for (slot, in_address, in_size) in remote_buffers(call.in_bufs) {
            copied_any = true;
            let out = call.out_bufs.get(slot).ok_or(ERR_MISSING_OUTPUT)?;
            let out_address = match out.address {
                Address::Remote(address) => address,
                Address::Local(_) => return Err(ERR_MISSING_OUTPUT),
            };
            let mut size = in_size.min(out.size).min(remaining);
            if self.chunk_size != 0 {
                size = size.min(self.chunk_size);
            }
            let data = call.memory.read(in_address, size).map_err(|_| ERR_MEMORY)?;
            call.memory.write(out_address, &data).map_err(|_| ERR_MEMORY)?;
            trace!("copied {} bytes from slot {}", size, slot);
            remaining -= size;
            last = Some(WireDescriptor {
                address: out_address,
                size: size as u32,
                access: 0,
            });
        }
        if !copied_any {
            return Err(ERR_NO_BUFFERS);
        }
        Ok((requested - remaining, last))
    }

    fn write_outcome(out_args: &mut ArgsMut<'_>, error: u32, generated: usize, last: Option<WireDescriptor>) -> RemoteResult<()> {
        out_args.write_u32(OUT_EXTENDED_ERROR, error)?;
        out_args.write_u32(OUT_BYTES_GENERATED, generated as u32)?;
        out_args.write_descriptor(OUT_LAST_BUFFER, &last.unwrap_or_default())?;
        Ok(())
    }

    fn fill_status(&self, call: &mut ControlCall<'_>, error: u32) -> RemoteResult<()> {
        call.status.write_u32(STATUS_EXTENDED_ERROR, error)?;
        call.status
            .write_u32(STATUS_BYTES_PROCESSED, self.bytes_processed as u32)?;
        Ok(())
    }

    fn write_version(call: &mut ControlCall<'_>) -> RemoteResult<usize> {
        let data = call.status.read_descriptor(STATUS_DATA)?;
        if data.address == 0 {
            return Ok(0);
        }
        let length = VERSION.len().min(data.size as usize);
        call.memory.write(data.address, &VERSION.as_bytes()[..length])?;
        Ok(length)
    }
}

impl Algorithm for CopyAlgorithm {
    fn process(&mut self, mut call: ProcessCall<'_>) -> AlgStatus {
        let (status, error, generated, last) = match self.copy_buffers(&mut call) {
            Ok((generated, last)) => (EOK, 0, generated, last),
            Err(error) => (EFAIL, error, 0, None),
        };
        self.bytes_processed += generated as u64;
        match Self::write_outcome(&mut call.out_args, error, generated, last) {
            Ok(()) => status,
            Err(_) => EFAIL,
        }
    }

    fn control(&mut self, mut call: ControlCall<'_>) -> AlgStatus {
        debug!("copy control command {}", call.id);
        let result = match call.id {
            GETSTATUS => self.fill_status(&mut call, 0).map(|_| EOK),
            SETPARAMS => match call.params.read_u32(PARAMS_CHUNK_SIZE) {
                Ok(chunk_size) => {
                    self.chunk_size = chunk_size as usize;
                    self.fill_status(&mut call, 0).map(|_| EOK)
                }
                Err(_) => Ok(EFAIL),
            },
            RESET => {
                self.bytes_processed = 0;
                self.chunk_size = 0;
                self.fill_status(&mut call, 0).map(|_| EOK)
            }
            GETVERSION => Self::write_version(&mut call)
                .and_then(|_| self.fill_status(&mut call, 0))
                .map(|_| EOK),
            _ => self
                .fill_status(&mut call, ERR_UNSUPPORTED_COMMAND)
                .map(|_| EFAIL),
        };
        result.unwrap_or(EFAIL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invocation_interface::{
        cache::{CachePolicy, CoherencePolicy},
        codec::{ArgsRef, ExtensibleArgs},
        config::InvocationConfig,
        memory_domain::{shared::SharedMemoryDomain, AddressTranslator, RemoteMemory},
        message::MessagePool,
        skeleton::Skeleton,
        stub::RemoteHandle,
        test_utils::{CacheOp, RecordingCache},
        transport::inline::InlineTransport,
        BufferDescriptor, SparseBufferList,
    };
    use std::sync::Arc;

    fn args(size: usize, fields: &[(usize, u32)]) -> Vec<u8> {
        let mut bytes = vec![0u8; size];
        bytes[..4].copy_from_slice(&(size as u32).to_le_bytes());
        for (offset, value) in fields {
            bytes[*offset..*offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn process_copies_matching_slots() {
        let domain = SharedMemoryDomain::new(0x8000_0000, 0x10_0000);
        let input = domain.acquire_region(16).unwrap();
        let output = domain.acquire_region(16).unwrap();
        input.write(0, b"0123456789abcdef").unwrap();
        let in_bufs = SparseBufferList::from_slots(&[(2, BufferDescriptor::remote(input.remote_address(0), 16))]);
        let mut out_bufs =
            SparseBufferList::from_slots(&[(2, BufferDescriptor::remote(output.remote_address(0), 16))]);
        let in_args = args(8, &[(IN_NUM_BYTES, 10)]);
        let mut out_args = args(28, &[]);

        let mut algorithm = CopyAlgorithm::new();
        let status = algorithm.process(ProcessCall {
            memory: &domain,
            in_bufs: &in_bufs,
            out_bufs: &mut out_bufs,
            in_args: ArgsRef::new(&in_args),
            out_args: ArgsMut::new(&mut out_args),
        });
        assert_eq!(EOK, status);
        assert_eq!(b"0123456789".to_vec(), output.read(0, 10).unwrap());
        let view = ArgsRef::new(&out_args);
        assert_eq!(10, view.read_u32(OUT_BYTES_GENERATED).unwrap());
        let last = view.read_descriptor(OUT_LAST_BUFFER).unwrap();
        assert_eq!(output.remote_address(0), last.address);
        assert_eq!(10, last.size);
        assert_eq!(10, algorithm.bytes_processed);
    }

    #[test]
    fn process_without_buffers_fails_with_extended_error() {
        let domain = SharedMemoryDomain::new(0x8000_0000, 0x10_0000);
        let in_args = args(8, &[(IN_NUM_BYTES, 10)]);
        let mut out_args = args(28, &[]);
        let mut out_bufs = SparseBufferList::new();
        let status = CopyAlgorithm::new().process(ProcessCall {
            memory: &domain,
            in_bufs: &SparseBufferList::new(),
            out_bufs: &mut out_bufs,
            in_args: ArgsRef::new(&in_args),
            out_args: ArgsMut::new(&mut out_args),
        });
        assert_eq!(EFAIL, status);
        assert_eq!(
            ERR_NO_BUFFERS,
            ArgsRef::new(&out_args).read_u32(OUT_EXTENDED_ERROR).unwrap()
        );
    }

    #[test]
    fn control_commands() {
        let domain = SharedMemoryDomain::new(0x8000_0000, 0x10_0000);
        let version_buffer = domain.acquire_region(64).unwrap();
        let mut algorithm = CopyAlgorithm::new();
        algorithm.bytes_processed = 42;

        let params = args(8, &[(PARAMS_CHUNK_SIZE, 4)]);
        let mut status = args(32, &[]);
        let call = |algorithm: &mut CopyAlgorithm, id: i32, status: &mut Vec<u8>| {
            algorithm.control(ControlCall {
                memory: &domain,
                id,
                params: ArgsRef::new(&params),
                status: ArgsMut::new(status),
            })
        };
        assert_eq!(EOK, call(&mut algorithm, GETSTATUS, &mut status));
        assert_eq!(42, ArgsRef::new(&status).read_u32(STATUS_BYTES_PROCESSED).unwrap());
        assert_eq!(EOK, call(&mut algorithm, SETPARAMS, &mut status));
        assert_eq!(4, algorithm.chunk_size);
        assert_eq!(EOK, call(&mut algorithm, RESET, &mut status));
        assert_eq!(0, algorithm.bytes_processed);
        assert_eq!(0, algorithm.chunk_size);
        assert_eq!(EFAIL, call(&mut algorithm, 99, &mut status));
        assert_eq!(
            ERR_UNSUPPORTED_COMMAND,
            ArgsRef::new(&status).read_u32(STATUS_EXTENDED_ERROR).unwrap()
        );

        ArgsMut::new(&mut status)
            .write_descriptor(
                STATUS_DATA,
                &WireDescriptor {
                    address: version_buffer.remote_address(0),
                    size: 64,
                    access: 0,
                },
            )
            .unwrap();
        assert_eq!(EOK, call(&mut algorithm, GETVERSION, &mut status));
        assert_eq!(
            VERSION.as_bytes().to_vec(),
            domain
                .read(version_buffer.remote_address(0), VERSION.len())
                .unwrap()
        );
    }

    #[test_log::test]
    fn copy_through_handle_keeps_buffers_coherent() {
        let domain = Arc::new(SharedMemoryDomain::new(0x8000_0000, 0x10_0000));
        let cache = Arc::new(RecordingCache::default());
        let policy = CachePolicy::PerBufferInvalidateWriteback;
        let skeleton = Skeleton::new(
            Box::new(CopyAlgorithm::new()),
            COPY_CLASS,
            CoherencePolicy::new(policy, cache.clone()),
            domain.clone() as Arc<dyn RemoteMemory>,
        );
        let mut handle = RemoteHandle::new(
            COPY_CLASS,
            Box::new(InlineTransport::new(MessagePool::new(1, 2048), skeleton)),
            domain.clone() as Arc<dyn AddressTranslator>,
            InvocationConfig {
                checked: true,
                cache_policy: policy,
                record_timings: false,
            },
        );
        let input = domain.acquire_region(32).unwrap();
        input.write(0, &[7u8; 32]).unwrap();
        let output = domain.acquire_region(32).unwrap();
        let mut in_bufs =
            SparseBufferList::from_slots(&[(1, BufferDescriptor::local(input.local_address(0), 32))]);
        let mut out_bufs =
            SparseBufferList::from_slots(&[(1, BufferDescriptor::local(output.local_address(0), 32))]);
        let mut in_args = ExtensibleArgs::new(COPY_CLASS.in_args_base);
        in_args.write_u32(IN_NUM_BYTES, 32).unwrap();
        let mut out_args = ExtensibleArgs::new(COPY_CLASS.out_args_base);

        let reply = handle
            .process(&mut in_bufs, &mut out_bufs, &in_args, &mut out_args)
            .unwrap();
        assert_eq!(EOK, reply.status);
        assert!(reply.violations.is_empty());
        assert_eq!(vec![7u8; 32], output.read(0, 32).unwrap());
        assert_eq!(
            output.local_address(0) as u64,
            out_args.read_descriptor(OUT_LAST_BUFFER).unwrap().address
        );
        assert_eq!(
            vec![
                CacheOp::Invalidate(input.remote_address(0), 32),
                CacheOp::Invalidate(output.remote_address(0), 32),
                CacheOp::Writeback(output.remote_address(0), 32),
            ],
            cache.operations()
        );
    }
}
