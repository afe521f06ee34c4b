use crate::{
    cache::CoherencePolicy,
    codec::{
        buffers::{decode_buffer_list, encode_remote_list},
        ArgsMut, ArgsRef,
    },
    memory_domain::RemoteMemory,
    message::{
        Command, ControlLayout, Message, ProcessLayout, CONTROL_ID_OFFSET, IN_BUFS_OFFSET,
        OUT_BUFS_OFFSET,
    },
    Address, AlgorithmClass, BufferDescriptor, SparseBufferList, MAX_IO_BUFFERS,
};
use log::{trace, warn};
use remote_commons::{AlgStatus, RemoteResult, EFAIL};
use std::sync::Arc;

/// Arguments of a process call as the algorithm sees them.
/// Buffer addresses are target domain addresses, their bytes are reached through `memory`.
pub struct ProcessCall<'a> {
    pub memory: &'a dyn RemoteMemory,
    pub in_bufs: &'a SparseBufferList,
    /// may be rewritten by classes that return their output buffers reordered
    pub out_bufs: &'a mut SparseBufferList,
    pub in_args: ArgsRef<'a>,
    pub out_args: ArgsMut<'a>,
}

pub struct ControlCall<'a> {
    pub memory: &'a dyn RemoteMemory,
    pub id: i32,
    pub params: ArgsRef<'a>,
    pub status: ArgsMut<'a>,
}

/// Operations an algorithm offers to remote callers
pub trait Algorithm: Send {
    fn process(&mut self, call: ProcessCall<'_>) -> AlgStatus;
    fn control(&mut self, call: ControlCall<'_>) -> AlgStatus;
}

/// Target side of an instance: unpacks messages, keeps the caches coherent and
/// runs the bound algorithm. The binding is fixed at construction.
pub struct Skeleton {
    algorithm: Box<dyn Algorithm>,
    class: AlgorithmClass,
    coherence: CoherencePolicy,
    memory: Arc<dyn RemoteMemory>,
}

impl Skeleton {
    pub fn new(
        algorithm: Box<dyn Algorithm>,
        class: AlgorithmClass,
        coherence: CoherencePolicy,
        memory: Arc<dyn RemoteMemory>,
    ) -> Self {
        Skeleton {
            algorithm,
            class,
            coherence,
            memory,
        }
    }

    pub fn class(&self) -> &AlgorithmClass {
        &self.class
    }

    /// Handle one message in place. Every message gets a status, failures to
    /// understand the message are answered with `EFAIL`.
    pub fn call(&mut self, message: &mut Message) {
        let result = match message.command() {
            Some(Command::Process) => self.process(message),
            Some(Command::Control) => self.control(message),
            None => {
                warn!(
                    "{}: unknown command {} in message",
                    self.class.name,
                    message.command_raw()
                );
                Ok(EFAIL)
            }
        };
        let status = result.unwrap_or_else(|err| {
            warn!("{}: failed to dispatch message: {:?}", self.class.name, err);
            EFAIL
        });
        message.set_status(status);
    }

    fn process(&mut self, message: &mut Message) -> RemoteResult<AlgStatus> {
        let in_bufs = decode_buffer_list(&*message, IN_BUFS_OFFSET)?;
        let mut out_bufs = decode_buffer_list(&*message, OUT_BUFS_OFFSET)?;

        // the buffers are committed to the call even if its arguments are unusable
        self.coherence.before_invocation(&in_bufs, &out_bufs);
        let layout = match ProcessLayout::locate(message) {
            Ok(layout) => layout,
            Err(err) => {
                self.coherence.after_invocation(&out_bufs);
                return Err(err);
            }
        };
        let status = {
            let (in_args, out_args) = message.split_regions(layout.in_args, layout.out_args)?;
            self.algorithm.process(ProcessCall {
                memory: self.memory.as_ref(),
                in_bufs: &in_bufs,
                out_bufs: &mut out_bufs,
                in_args: ArgsRef::new(in_args),
                out_args: ArgsMut::new(out_args),
            })
        };
        self.coherence.after_invocation(&out_bufs);

        if self.class.out_buffers_reordered {
            encode_remote_list(message, OUT_BUFS_OFFSET, &out_bufs)?;
        }
        trace!("{}: process returned {}", self.class.name, status);
        Ok(status)
    }

    fn control(&mut self, message: &mut Message) -> RemoteResult<AlgStatus> {
        let id = message.read_i32(CONTROL_ID_OFFSET)?;
        let layout = ControlLayout::locate(message)?;
        let status_buffer = self.status_buffer(message, &layout)?;

        self.coherence.before_control(status_buffer.as_ref());
        let status = {
            let (params, status) = message.split_regions(layout.params, layout.status)?;
            self.algorithm.control(ControlCall {
                memory: self.memory.as_ref(),
                id,
                params: ArgsRef::new(params),
                status: ArgsMut::new(status),
            })
        };
        self.coherence.after_control(status_buffer.as_ref());
        trace!("{}: control {} returned {}", self.class.name, id, status);
        Ok(status)
    }

    /// Buffer embedded in the status structure, if the class has one and the
    /// structure is large enough to hold it
    fn status_buffer(
        &self,
        message: &Message,
        layout: &ControlLayout,
    ) -> RemoteResult<Option<BufferDescriptor>> {
        let offset = match self.class.status_buffer {
            Some(offset) => offset,
            None => return Ok(None),
        };
        if offset + crate::message::DESCRIPTOR_WIRE_SIZE > layout.status.len() {
            return Ok(None);
        }
        let wire = message.read_descriptor(layout.status.start + offset)?;
        if wire.address == 0 {
            return Ok(None);
        }
        Ok(Some(BufferDescriptor::remote(wire.address, wire.size as usize)))
    }
}

/// Iterate the target domain addresses of a list, for algorithms that walk their buffers
pub fn remote_buffers(list: &SparseBufferList) -> impl Iterator<Item = (usize, u64, usize)> + '_ {
    (0..MAX_IO_BUFFERS).filter_map(move |slot| match list.get(slot) {
        Some(BufferDescriptor {
            address: Address::Remote(address),
            size,
            ..
        }) => Some((slot, *address, *size)),
        _ => None,
    })
}
