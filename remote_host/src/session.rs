use crate::{
    algorithms::{
        CopyAlgorithm, COPY_CLASS, GETSTATUS, GETVERSION, IN_NUM_BYTES, OUT_BYTES_GENERATED,
        OUT_LAST_BUFFER, STATUS_BYTES_PROCESSED, STATUS_DATA,
    },
    config::HostConfig,
};
use invocation_interface::{
    cache::{CoherencePolicy, HostCache},
    codec::ExtensibleArgs,
    memory_domain::{
        shared::{MemoryRegion, SharedMemoryDomain},
        AddressTranslator, RemoteMemory,
    },
    message::{MessagePool, WireDescriptor},
    skeleton::Skeleton,
    stub::{RemoteHandle, Reply, WaitOutcome},
    transport::{inline::InlineTransport, loopback::RemoteDomain, Timeout, Transport},
    BufferDescriptor, SparseBufferList,
};
use log::{debug, info, warn};
use remote_commons::{records::RecordPoint, RemoteError, RemoteResult};
use std::{sync::Arc, time::Duration};

const WINDOW_BASE: u64 = 0x8000_0000;
const WINDOW_SIZE: u64 = 0x1000_0000;
const VERSION_BUFFER_SIZE: usize = 64;

#[derive(Debug, Default)]
pub struct SessionSummary {
    pub calls: usize,
    pub async_calls: usize,
    pub bytes_copied: u64,
    pub failures: usize,
    pub violations: usize,
    /// bytes the algorithm reports as processed
    pub bytes_reported: u32,
    pub version: String,
    pub mean_round_trip: Option<Duration>,
}

/// One handle bound to a copy algorithm plus the shared buffers it works on
pub struct Session {
    handle: RemoteHandle,
    shared: Arc<SharedMemoryDomain>,
    pool: MessagePool,
    iterations: usize,
    buffer_size: usize,
    // dropped after the handle
    _remote: Option<RemoteDomain>,
}

impl Session {
    pub fn new(config: &HostConfig) -> RemoteResult<Session> {
        config.validate()?;
        let shared = Arc::new(SharedMemoryDomain::new(WINDOW_BASE, WINDOW_SIZE));
        let pool = MessagePool::new(config.pool_size, config.max_message_size);
        let skeleton = Skeleton::new(
            Box::new(CopyAlgorithm::new()),
            COPY_CLASS,
            CoherencePolicy::new(config.invocation.cache_policy, Arc::new(HostCache {})),
            shared.clone() as Arc<dyn RemoteMemory>,
        );
        let (transport, remote): (Box<dyn Transport>, Option<RemoteDomain>) = if config.local {
            (Box::new(InlineTransport::new(pool.clone(), skeleton)), None)
        } else {
            let remote = RemoteDomain::start(config.remote_core);
            let transport = remote.create_instance(skeleton, pool.clone())?;
            (Box::new(transport), Some(remote))
        };
        info!(
            "bound {} {} with {} messages of {} bytes",
            COPY_CLASS.name,
            if config.local { "locally" } else { "remotely" },
            config.pool_size,
            config.max_message_size
        );
        let handle = RemoteHandle::new(
            COPY_CLASS,
            transport,
            shared.clone() as Arc<dyn AddressTranslator>,
            config.invocation,
        );
        return Ok(Session {
            handle,
            shared,
            pool,
            iterations: config.iterations,
            buffer_size: config.buffer_size,
            _remote: remote,
        });
    }

    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    fn copy_once(
        &mut self,
        iteration: usize,
        input: &MemoryRegion,
        output: &MemoryRegion,
        summary: &mut SessionSummary,
    ) -> RemoteResult<()> {
        let pattern: Vec<u8> = (0..self.buffer_size)
            .map(|index| ((iteration + index) % 251) as u8)
            .collect();
        input.write(0, &pattern)?;
        output.write(0, &vec![0u8; self.buffer_size])?;

        let mut in_bufs =
            SparseBufferList::from_slots(&[(0, BufferDescriptor::local(input.local_address(0), self.buffer_size))]);
        let mut out_bufs =
            SparseBufferList::from_slots(&[(0, BufferDescriptor::local(output.local_address(0), self.buffer_size))]);
        let mut in_args = ExtensibleArgs::new(COPY_CLASS.in_args_base);
        in_args.write_u32(IN_NUM_BYTES, self.buffer_size as u32)?;
        let mut out_args = ExtensibleArgs::new(COPY_CLASS.out_args_base);

        let asynchronous = !self.handle.is_local() && iteration % 2 == 1;
        let reply = if asynchronous {
            self.handle
                .process_async(&mut in_bufs, &mut out_bufs, &in_args, &mut out_args)?;
            summary.async_calls += 1;
            match self.handle.process_wait(
                &mut out_bufs,
                &in_args,
                &mut out_args,
                Timeout::Forever,
            )? {
                WaitOutcome::Complete(reply) => reply,
                WaitOutcome::Pending => return Err(RemoteError::NoPendingCall),
            }
        } else {
            self.handle
                .process(&mut in_bufs, &mut out_bufs, &in_args, &mut out_args)?
        };
        summary.calls += 1;
        self.account(&reply, summary);

        let generated = out_args.read_u32(OUT_BYTES_GENERATED)? as usize;
        let last = out_args.read_descriptor(OUT_LAST_BUFFER)?;
        let copied = output.read(0, self.buffer_size)?;
        if !reply.is_ok()
            || generated != self.buffer_size
            || last.address != output.local_address(0) as u64
            || copied != pattern
        {
            warn!(
                "iteration {} returned status {} with {} of {} bytes",
                iteration, reply.status, generated, self.buffer_size
            );
            summary.failures += 1;
        } else {
            summary.bytes_copied += generated as u64;
        }
        return Ok(());
    }

    fn account(&self, reply: &Reply, summary: &mut SessionSummary) {
        summary.violations += reply.violations.len();
        if let Some(timings) = &reply.timings {
            if let Some(span) = timings.span(RecordPoint::MarshalStart, RecordPoint::UnmarshalEnd) {
                let calls = summary.calls as u32;
                let previous = summary.mean_round_trip.unwrap_or_default();
                // running mean over the calls accounted so far
                summary.mean_round_trip =
                    Some((previous * (calls - 1) + span) / calls.max(1));
            }
        }
    }

    fn query(&mut self, summary: &mut SessionSummary, version_buffer: &MemoryRegion) -> RemoteResult<()> {
        let params = ExtensibleArgs::new(COPY_CLASS.dyn_params_base);
        let mut status = ExtensibleArgs::new(COPY_CLASS.status_base);
        let reply = self.handle.control(GETSTATUS, &params, &mut status)?;
        summary.violations += reply.violations.len();
        if !reply.is_ok() {
            summary.failures += 1;
        }
        summary.bytes_reported = status.read_u32(STATUS_BYTES_PROCESSED)?;

        let mut status = ExtensibleArgs::new(COPY_CLASS.status_base);
        status.write_descriptor(
            STATUS_DATA,
            &WireDescriptor {
                address: version_buffer.local_address(0) as u64,
                size: VERSION_BUFFER_SIZE as u32,
                access: 0,
            },
        )?;
        let reply = self.handle.control(GETVERSION, &params, &mut status)?;
        summary.violations += reply.violations.len();
        if !reply.is_ok() {
            summary.failures += 1;
        }
        let version = version_buffer.read(0, VERSION_BUFFER_SIZE)?;
        let end = version.iter().position(|byte| *byte == 0).unwrap_or(version.len());
        summary.version = String::from_utf8_lossy(&version[..end]).into_owned();
        return Ok(());
    }

    /// Issue the configured number of copy calls, alternating synchronous and
    /// asynchronous calls on remote handles, then query status and version
    pub fn run(&mut self) -> RemoteResult<SessionSummary> {
        let input = self.shared.acquire_region(self.buffer_size)?;
        let output = self.shared.acquire_region(self.buffer_size)?;
        let version_buffer = self.shared.acquire_region(VERSION_BUFFER_SIZE)?;
        let mut summary = SessionSummary::default();

        let mut result = Ok(());
        for iteration in 0..self.iterations {
            result = self.copy_once(iteration, &input, &output, &mut summary);
            if result.is_err() {
                break;
            }
        }
        let result = result.and_then(|_| self.query(&mut summary, &version_buffer));

        for region in [&input, &output, &version_buffer] {
            self.shared.release_region(region)?;
        }
        result?;
        debug!("session finished: {:?}", summary);
        return Ok(summary);
    }
}
