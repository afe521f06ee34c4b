use crate::{
    codec::{
        args::{marshal_args, marshal_size_only, unmarshal_args, validate},
        buffers::{
            reset_access_hints, translate_buffer_list, unmarshal_out_buffers, validate_list,
            write_buffer_list,
        },
        ExtensibleArgs,
    },
    config::InvocationConfig,
    memory_domain::AddressTranslator,
    message::{
        control_message_size, process_message_size, Command, ControlLayout, Message,
        MessageView, ProcessLayout, WireDescriptor, CONTROL_ID_OFFSET, CONTROL_PARAMS_OFFSET,
        DESCRIPTOR_WIRE_SIZE, IN_ARGS_OFFSET, IN_BUFS_OFFSET, OUT_BUFS_OFFSET,
    },
    transport::{Timeout, Transport},
    AlgorithmClass, SparseBufferList,
};
use log::{debug, error, trace, warn};
use remote_commons::{
    records::{RecordPoint, Recorder},
    AlgStatus, ContractViolation, RemoteError, RemoteResult, EOK,
};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    Sync,
    Async,
}

/// Progress of the call on a handle, a handle has at most one call in flight
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    Marshaling,
    AwaitingReply(CallMode),
    /// reply observed, results are being copied back
    Completed,
}

/// Result of a call that reached the algorithm
#[derive(Debug)]
pub struct Reply {
    pub status: AlgStatus,
    /// guarantees the callee broke, only collected in checked mode
    pub violations: Vec<ContractViolation>,
    pub timings: Option<Recorder>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == EOK
    }
}

#[derive(Debug)]
pub enum WaitOutcome {
    /// no reply within the timeout, the call is still outstanding
    Pending,
    Complete(Reply),
}

/// What the stub keeps between issuing an asynchronous call and harvesting its reply
struct PendingCall {
    checked: bool,
    in_args_snapshot: Vec<u8>,
    recorder: Option<Recorder>,
    /// bytes of the reply up to the end of the out args
    reply_len: usize,
    /// copy of a reply drained early by a control call, its message is already back in the pool
    parked: Option<Vec<u8>>,
}

/// Caller side of an algorithm instance
pub struct RemoteHandle {
    class: AlgorithmClass,
    transport: Box<dyn Transport>,
    translator: Arc<dyn AddressTranslator>,
    config: InvocationConfig,
    state: InvocationState,
    pending: Option<PendingCall>,
}

fn first_difference(expected: &[u8], found: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(found.iter())
        .position(|(a, b)| a != b)
        .or_else(|| (expected.len() != found.len()).then(|| expected.len().min(found.len())))
}

fn record(recorder: &mut Option<Recorder>, point: RecordPoint) {
    if let Some(recorder) = recorder {
        if let Err(err) = recorder.record(point) {
            error!("failed to record {:?}: {:?}", point, err);
        }
    }
}

impl RemoteHandle {
    pub fn new(
        class: AlgorithmClass,
        transport: Box<dyn Transport>,
        translator: Arc<dyn AddressTranslator>,
        config: InvocationConfig,
    ) -> Self {
        RemoteHandle {
            class,
            transport,
            translator,
            config,
            state: InvocationState::Idle,
            pending: None,
        }
    }

    pub fn class(&self) -> &AlgorithmClass {
        &self.class
    }

    pub fn config(&self) -> InvocationConfig {
        self.config
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn is_local(&self) -> bool {
        self.transport.is_local()
    }

    fn transition(&mut self, next: InvocationState) {
        trace!("{}: {:?} -> {:?}", self.class.name, self.state, next);
        self.state = next;
    }

    /// Back to rest after a call, an outstanding asynchronous call keeps the handle busy
    fn settle(&mut self) {
        let next = if self.pending.is_some() {
            InvocationState::AwaitingReply(CallMode::Async)
        } else {
            InvocationState::Idle
        };
        self.transition(next);
    }

    fn report(&self, violations: &[ContractViolation]) {
        for violation in violations {
            error!("{}: contract violation by callee: {:?}", self.class.name, violation);
        }
    }

    /// Validate and marshal a process call. Nothing is allocated unless all arguments are valid.
    fn marshal_process(
        &mut self,
        config: InvocationConfig,
        in_bufs: &mut SparseBufferList,
        out_bufs: &mut SparseBufferList,
        in_args: &ExtensibleArgs,
        out_args: &mut ExtensibleArgs,
    ) -> RemoteResult<(Message, PendingCall)> {
        if self.pending.is_some() {
            return Err(RemoteError::CallOutstanding);
        }
        let mut recorder = config.record_timings.then(Recorder::new);
        record(&mut recorder, RecordPoint::MarshalStart);
        self.transition(InvocationState::Marshaling);

        let in_size = validate(in_args, self.class.in_args_base)?;
        let out_size = validate(out_args, self.class.out_args_base)?;
        let required = process_message_size(in_size, out_size);
        let capacity = self.transport.max_payload_size();
        if required > capacity {
            return Err(RemoteError::UnsupportedSize { required, capacity });
        }
        validate_list(in_bufs)?;
        validate_list(out_bufs)?;
        // both lists translate or the caller's hints stay as they are
        let in_wire = translate_buffer_list(self.translator.as_ref(), in_bufs)?;
        let out_wire = translate_buffer_list(self.translator.as_ref(), out_bufs)?;

        let in_args_snapshot = if config.checked {
            out_args.scrub();
            in_args.declared().to_vec()
        } else {
            Vec::new()
        };

        let mut message = self
            .transport
            .allocate()
            .ok_or(RemoteError::AllocationFailed)?;
        message.set_command(Command::Process);
        write_buffer_list(&mut message, IN_BUFS_OFFSET, &in_wire)?;
        write_buffer_list(&mut message, OUT_BUFS_OFFSET, &out_wire)?;
        let out_args_offset = marshal_args(&mut message, IN_ARGS_OFFSET, in_args)?;
        marshal_size_only(&mut message, out_args_offset, out_args)?;
        reset_access_hints(in_bufs);
        reset_access_hints(out_bufs);

        Ok((
            message,
            PendingCall {
                checked: config.checked,
                in_args_snapshot,
                recorder,
                reply_len: ProcessLayout::new(in_size, out_size).out_args.end,
                parked: None,
            },
        ))
    }

    /// Copy the results of a process reply back into the caller's structures
    fn unmarshal_process(
        &mut self,
        message: MessageView<'_>,
        mut call: PendingCall,
        out_bufs: &mut SparseBufferList,
        in_args: &ExtensibleArgs,
        out_args: &mut ExtensibleArgs,
    ) -> RemoteResult<Reply> {
        record(&mut call.recorder, RecordPoint::ReplyReceived);
        self.transition(InvocationState::Completed);
        if message.command() != Some(Command::Process) {
            return Err(RemoteError::ReplyMismatch {
                expected: Command::Process as u32,
                found: message.command_raw(),
            });
        }
        let status = message.status();
        let layout = ProcessLayout::new(in_args.size(), out_args.size());

        let mut violations = Vec::new();
        if call.checked {
            if let Some(offset) =
                first_difference(&call.in_args_snapshot, message.slice(layout.in_args.clone())?)
            {
                violations.push(ContractViolation::ReadOnlyViolation {
                    structure: "inArgs",
                    offset,
                });
            }
            let found = message.read_size_field(layout.out_args.start)?;
            if found != out_args.size() {
                violations.push(ContractViolation::OutArgsSizeChanged {
                    expected: out_args.size(),
                    found,
                });
            }
        }

        unmarshal_args(message.slice(layout.out_args.clone())?, out_args)?;
        if status == EOK {
            self.translate_out_args_buffers(out_args)?;
        }
        unmarshal_out_buffers(
            self.translator.as_ref(),
            message,
            OUT_BUFS_OFFSET,
            out_bufs,
            self.class.out_buffers_reordered && status == EOK,
        )?;

        record(&mut call.recorder, RecordPoint::UnmarshalEnd);
        self.report(&violations);
        Ok(Reply {
            status,
            violations,
            timings: call.recorder,
        })
    }

    /// Buffers the callee reports through its out args carry target domain addresses
    fn translate_out_args_buffers(&self, out_args: &mut ExtensibleArgs) -> RemoteResult<()> {
        for offset in self.class.out_args_buffers {
            if offset + DESCRIPTOR_WIRE_SIZE > out_args.size() {
                continue;
            }
            let desc = out_args.read_descriptor(*offset)?;
            if desc.address == 0 {
                continue;
            }
            let local = self
                .translator
                .to_local(desc.address, desc.size as usize)
                .map(|local| local as u64);
            if local.is_none() {
                warn!(
                    "{}: buffer 0x{:x} in out args could not be translated back",
                    self.class.name, desc.address
                );
            }
            out_args.write_descriptor(
                *offset,
                &WireDescriptor {
                    address: local.unwrap_or(0),
                    size: desc.size,
                    access: 0,
                },
            )?;
        }
        Ok(())
    }

    /// Synchronous process call, returns once the results are copied back
    pub fn process(
        &mut self,
        in_bufs: &mut SparseBufferList,
        out_bufs: &mut SparseBufferList,
        in_args: &ExtensibleArgs,
        out_args: &mut ExtensibleArgs,
    ) -> RemoteResult<Reply> {
        let config = self.config;
        let result = self.process_sync(config, in_bufs, out_bufs, in_args, out_args);
        self.settle();
        result
    }

    fn process_sync(
        &mut self,
        config: InvocationConfig,
        in_bufs: &mut SparseBufferList,
        out_bufs: &mut SparseBufferList,
        in_args: &ExtensibleArgs,
        out_args: &mut ExtensibleArgs,
    ) -> RemoteResult<Reply> {
        let (message, mut call) = self.marshal_process(config, in_bufs, out_bufs, in_args, out_args)?;
        self.transition(InvocationState::AwaitingReply(CallMode::Sync));
        record(&mut call.recorder, RecordPoint::TransportStart);
        let reply = self.transport.call_blocking(message).map_err(|err| {
            error!("{}: process call failed in transport: {:?}", self.class.name, err);
            RemoteError::Transport(err)
        })?;
        let result = self.unmarshal_process(reply.view(), call, out_bufs, in_args, out_args);
        self.transport.free(reply);
        result
    }

    /// Start a process call without waiting for it, the reply is collected with
    /// [`RemoteHandle::process_wait`]
    pub fn process_async(
        &mut self,
        in_bufs: &mut SparseBufferList,
        out_bufs: &mut SparseBufferList,
        in_args: &ExtensibleArgs,
        out_args: &mut ExtensibleArgs,
    ) -> RemoteResult<()> {
        if self.transport.is_local() {
            return Err(RemoteError::LocalHandle);
        }
        let config = self.config;
        let result = self
            .marshal_process(config, in_bufs, out_bufs, in_args, out_args)
            .and_then(|(message, mut call)| {
                record(&mut call.recorder, RecordPoint::TransportStart);
                self.transport
                    .call_non_blocking(message)
                    .map_err(RemoteError::Transport)?;
                self.pending = Some(call);
                Ok(())
            });
        if let Err(err) = &result {
            debug!("{}: asynchronous process not issued: {:?}", self.class.name, err);
        }
        self.settle();
        result
    }

    /// Collect the reply of the outstanding asynchronous process call.
    /// When no reply arrives within the timeout the call stays outstanding and
    /// waiting again is allowed.
    pub fn process_wait(
        &mut self,
        out_bufs: &mut SparseBufferList,
        in_args: &ExtensibleArgs,
        out_args: &mut ExtensibleArgs,
        timeout: Timeout,
    ) -> RemoteResult<WaitOutcome> {
        if self.transport.is_local() {
            return Err(RemoteError::LocalHandle);
        }
        let parked = match &self.pending {
            Some(call) => call.parked.is_some(),
            None => return Err(RemoteError::NoPendingCall),
        };
        let message = if parked {
            None
        } else {
            match self.transport.await_completion(timeout) {
                Ok(Some(message)) => Some(message),
                Ok(None) => return Ok(WaitOutcome::Pending),
                Err(err) => {
                    error!("{}: waiting for process reply failed: {:?}", self.class.name, err);
                    self.pending = None;
                    self.settle();
                    return Err(RemoteError::Transport(err));
                }
            }
        };
        let result = match self.pending.take() {
            Some(mut call) => match (call.parked.take(), message) {
                (Some(copy), _) => {
                    self.unmarshal_process(MessageView::new(&copy), call, out_bufs, in_args, out_args)
                }
                (None, Some(message)) => {
                    let result =
                        self.unmarshal_process(message.view(), call, out_bufs, in_args, out_args);
                    self.transport.free(message);
                    result
                }
                (None, None) => Err(RemoteError::NoPendingCall),
            },
            None => Err(RemoteError::NoPendingCall),
        };
        self.settle();
        result.map(WaitOutcome::Complete)
    }

    /// Take the reply of an outstanding process call off the transport and keep a copy
    /// of it on the handle, so a call of another kind can use the transport and the
    /// message pool
    fn drain_outstanding(&mut self) -> RemoteResult<()> {
        let needs_drain = matches!(&self.pending, Some(call) if call.parked.is_none());
        if !needs_drain {
            return Ok(());
        }
        debug!("{}: draining outstanding process reply", self.class.name);
        let message = loop {
            match self.transport.await_completion(Timeout::Forever) {
                Ok(Some(message)) => break message,
                Ok(None) => continue,
                Err(err) => {
                    self.pending = None;
                    return Err(RemoteError::Transport(err));
                }
            }
        };
        if message.command() != Some(Command::Process) {
            let found = message.command_raw();
            self.pending = None;
            return Err(RemoteError::ReplyMismatch {
                expected: Command::Process as u32,
                found,
            });
        }
        let reply_len = self.pending.as_ref().map_or(0, |call| call.reply_len);
        let copy = message.slice(0..reply_len).map(|bytes| bytes.to_vec());
        self.transport.free(message);
        match copy {
            Ok(copy) => {
                if let Some(call) = self.pending.as_mut() {
                    call.parked = Some(copy);
                }
                Ok(())
            }
            Err(err) => {
                self.pending = None;
                Err(err)
            }
        }
    }

    /// Synchronous control call. An outstanding process call is drained first,
    /// its reply stays available to the next [`RemoteHandle::process_wait`].
    pub fn control(
        &mut self,
        id: i32,
        params: &ExtensibleArgs,
        status: &mut ExtensibleArgs,
    ) -> RemoteResult<Reply> {
        let config = self.config;
        let result = self
            .drain_outstanding()
            .and_then(|_| self.control_sync(config, id, params, status));
        self.settle();
        result
    }

    fn control_sync(
        &mut self,
        config: InvocationConfig,
        id: i32,
        params: &ExtensibleArgs,
        status: &mut ExtensibleArgs,
    ) -> RemoteResult<Reply> {
        let mut recorder = config.record_timings.then(Recorder::new);
        record(&mut recorder, RecordPoint::MarshalStart);
        self.transition(InvocationState::Marshaling);

        let params_size = validate(params, self.class.dyn_params_base)?;
        let status_size = validate(status, self.class.status_base)?;
        let required = control_message_size(params_size, status_size);
        let capacity = self.transport.max_payload_size();
        if required > capacity {
            return Err(RemoteError::UnsupportedSize { required, capacity });
        }

        // caller view of the buffer embedded in the status, and its target domain form
        let status_buffer = match self.class.status_buffer {
            Some(offset) if offset + DESCRIPTOR_WIRE_SIZE <= status_size => {
                let local = status.read_descriptor(offset)?;
                if local.address == 0 {
                    None
                } else {
                    let remote = self
                        .translator
                        .to_remote(local.address as usize, local.size as usize)
                        .ok_or(RemoteError::TranslationFailed { slot: 0 })?;
                    Some((offset, local, remote))
                }
            }
            _ => None,
        };
        let params_snapshot = if config.checked {
            params.declared().to_vec()
        } else {
            Vec::new()
        };

        let mut message = self
            .transport
            .allocate()
            .ok_or(RemoteError::AllocationFailed)?;
        message.set_command(Command::Control);
        message.write_i32(CONTROL_ID_OFFSET, id)?;
        let status_offset = marshal_args(&mut message, CONTROL_PARAMS_OFFSET, params)?;
        marshal_size_only(&mut message, status_offset, status)?;
        if let Some((offset, local, remote)) = &status_buffer {
            message.write_descriptor(
                status_offset + offset,
                &WireDescriptor {
                    address: *remote,
                    size: local.size,
                    access: 0,
                },
            )?;
        }

        self.transition(InvocationState::AwaitingReply(CallMode::Sync));
        record(&mut recorder, RecordPoint::TransportStart);
        let message = self.transport.call_blocking(message).map_err(|err| {
            error!("{}: control call failed in transport: {:?}", self.class.name, err);
            RemoteError::Transport(err)
        })?;
        record(&mut recorder, RecordPoint::ReplyReceived);
        self.transition(InvocationState::Completed);
        if message.command() != Some(Command::Control) {
            return Err(RemoteError::ReplyMismatch {
                expected: Command::Control as u32,
                found: message.command_raw(),
            });
        }
        let result_status = message.status();
        let layout = ControlLayout::new(params_size, status_size);

        let mut violations = Vec::new();
        if config.checked {
            if let Some(offset) =
                first_difference(&params_snapshot, message.slice(layout.params.clone())?)
            {
                violations.push(ContractViolation::ReadOnlyViolation {
                    structure: "dynParams",
                    offset,
                });
            }
            let found = message.read_size_field(layout.status.start)?;
            if found != status_size {
                violations.push(ContractViolation::StatusSizeChanged {
                    expected: status_size,
                    found,
                });
            }
            if let Some((offset, local, _)) = &status_buffer {
                let returned = message.read_descriptor(layout.status.start + offset)?;
                if returned.size != local.size {
                    violations.push(ContractViolation::StatusBufferChanged {
                        expected: local.size as usize,
                        found: returned.size as usize,
                    });
                }
            }
        }

        unmarshal_args(message.slice(layout.status.clone())?, status)?;
        // the caller keeps its own address for the embedded buffer
        if let Some((offset, local, _)) = &status_buffer {
            status.write_descriptor(
                *offset,
                &WireDescriptor {
                    address: local.address,
                    size: local.size,
                    access: 0,
                },
            )?;
        }
        self.transport.free(message);

        record(&mut recorder, RecordPoint::UnmarshalEnd);
        self.report(&violations);
        Ok(Reply {
            status: result_status,
            violations,
            timings: recorder,
        })
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        let outstanding = matches!(&self.pending, Some(call) if call.parked.is_none());
        if outstanding {
            debug!("{}: collecting outstanding reply before teardown", self.class.name);
            if let Err(err) = self.transport.await_completion(Timeout::Forever) {
                warn!("{}: outstanding reply lost: {:?}", self.class.name, err);
            }
        }
    }
}
