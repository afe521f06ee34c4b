//! Doubles for the collaborators of the stub and the skeleton.

use crate::{
    cache::CacheController,
    codec::ArgsRef,
    memory_domain::AddressTranslator,
    message::{ControlLayout, Message, ProcessLayout, DESCRIPTOR_WIRE_SIZE},
    skeleton::{Algorithm, ControlCall, ProcessCall},
    transport::{Timeout, Transport},
};
use crossbeam::channel::{unbounded, Receiver, Sender};
use remote_commons::{AlgStatus, TransportError, EOK};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOp {
    Invalidate(u64, usize),
    Writeback(u64, usize),
    WritebackInvalidateAll,
}

/// Cache controller that only remembers what it was asked to do
#[derive(Debug, Default)]
pub struct RecordingCache {
    operations: Mutex<Vec<CacheOp>>,
}

impl RecordingCache {
    pub fn operations(&self) -> Vec<CacheOp> {
        self.operations
            .lock()
            .expect("Failed to get lock on recorded cache operations (lock is poisoned)!")
            .clone()
    }

    fn push(&self, op: CacheOp) {
        self.operations
            .lock()
            .expect("Failed to get lock on recorded cache operations (lock is poisoned)!")
            .push(op);
    }
}

impl CacheController for RecordingCache {
    fn invalidate(&self, address: u64, size: usize) {
        self.push(CacheOp::Invalidate(address, size));
    }
    fn writeback(&self, address: u64, size: usize) {
        self.push(CacheOp::Writeback(address, size));
    }
    fn writeback_invalidate_all(&self) {
        self.push(CacheOp::WritebackInvalidateAll);
    }
}

/// Translator that offsets addresses by a fixed base and counts its invocations.
/// Remote addresses below the base are not mapped.
#[derive(Debug)]
pub struct CountingTranslator {
    remote_base: u64,
    failing: Option<usize>,
    to_remote: AtomicUsize,
    to_local: AtomicUsize,
}

impl CountingTranslator {
    pub fn new(remote_base: u64) -> Self {
        CountingTranslator {
            remote_base,
            failing: None,
            to_remote: AtomicUsize::new(0),
            to_local: AtomicUsize::new(0),
        }
    }

    /// Refuse to translate the given local address
    pub fn failing_at(mut self, local: usize) -> Self {
        self.failing = Some(local);
        self
    }

    pub fn to_remote_calls(&self) -> usize {
        self.to_remote.load(Ordering::Acquire)
    }

    pub fn to_local_calls(&self) -> usize {
        self.to_local.load(Ordering::Acquire)
    }
}

impl AddressTranslator for CountingTranslator {
    fn to_remote(&self, local: usize, _size: usize) -> Option<u64> {
        self.to_remote.fetch_add(1, Ordering::AcqRel);
        if local == 0 || self.failing == Some(local) {
            return None;
        }
        (local as u64).checked_add(self.remote_base)
    }

    fn to_local(&self, remote: u64, _size: usize) -> Option<usize> {
        self.to_local.fetch_add(1, Ordering::AcqRel);
        remote
            .checked_sub(self.remote_base)
            .filter(|local| *local != 0)
            .and_then(|local| usize::try_from(local).ok())
    }
}

fn copy_payload(from: ArgsRef<'_>, to: &mut [u8]) {
    let from = from.as_bytes();
    let end = from.len().min(to.len());
    if end > 4 {
        to[4..end].copy_from_slice(&from[4..end]);
    }
}

/// Copies the payload of the in args into the out args, and of the params into the status
#[derive(Debug, Default)]
pub struct EchoAlgorithm {
    pub calls: usize,
}

impl Algorithm for EchoAlgorithm {
    fn process(&mut self, mut call: ProcessCall<'_>) -> AlgStatus {
        self.calls += 1;
        copy_payload(call.in_args, call.out_args.as_bytes_mut());
        EOK
    }

    fn control(&mut self, mut call: ControlCall<'_>) -> AlgStatus {
        self.calls += 1;
        copy_payload(call.params, call.status.as_bytes_mut());
        EOK
    }
}

type ProcessScript = Box<dyn FnMut(ProcessCall<'_>) -> AlgStatus + Send>;
type ControlScript = Box<dyn FnMut(ControlCall<'_>) -> AlgStatus + Send>;

/// Algorithm whose operations are given by the test
pub struct ScriptedAlgorithm {
    process: ProcessScript,
    control: ControlScript,
}

impl Default for ScriptedAlgorithm {
    fn default() -> Self {
        ScriptedAlgorithm {
            process: Box::new(|_| EOK),
            control: Box::new(|_| EOK),
        }
    }
}

impl ScriptedAlgorithm {
    pub fn on_process<F>(mut self, script: F) -> Self
    where
        F: FnMut(ProcessCall<'_>) -> AlgStatus + Send + 'static,
    {
        self.process = Box::new(script);
        self
    }

    pub fn on_control<F>(mut self, script: F) -> Self
    where
        F: FnMut(ControlCall<'_>) -> AlgStatus + Send + 'static,
    {
        self.control = Box::new(script);
        self
    }
}

impl Algorithm for ScriptedAlgorithm {
    fn process(&mut self, call: ProcessCall<'_>) -> AlgStatus {
        (self.process)(call)
    }

    fn control(&mut self, call: ControlCall<'_>) -> AlgStatus {
        (self.control)(call)
    }
}

/// Lets a [`GatedAlgorithm`] run one operation per release
pub struct Gate {
    sender: Sender<()>,
}

impl Gate {
    pub fn release(&self) {
        let _ = self.sender.send(());
    }
}

/// Blocks every operation until the test releases it through the [`Gate`].
/// Dropping the gate lets all further operations through.
pub struct GatedAlgorithm<A: Algorithm> {
    inner: A,
    gate: Receiver<()>,
}

impl<A: Algorithm> GatedAlgorithm<A> {
    pub fn new(inner: A) -> (Self, Gate) {
        let (sender, gate) = unbounded();
        (GatedAlgorithm { inner, gate }, Gate { sender })
    }
}

impl<A: Algorithm> Algorithm for GatedAlgorithm<A> {
    fn process(&mut self, call: ProcessCall<'_>) -> AlgStatus {
        let _ = self.gate.recv();
        self.inner.process(call)
    }

    fn control(&mut self, call: ControlCall<'_>) -> AlgStatus {
        let _ = self.gate.recv();
        self.inner.control(call)
    }
}

/// Change a reply the way a misbehaving callee would
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tamper {
    /// flip a byte of the in args at the offset
    InArgsByte(usize),
    /// overwrite the size field of the out args
    OutArgsSize(u32),
    /// flip a byte of the dynamic params at the offset
    ParamsByte(usize),
    /// overwrite the size field of the status
    StatusSize(u32),
    /// overwrite the size of the descriptor at the offset inside the status
    StatusBufferSize(usize, u32),
    /// overwrite the command of the reply
    Command(u32),
}

/// Transport that tampers with every reply of the transport it wraps
pub struct TamperingTransport {
    inner: Box<dyn Transport>,
    tamper: Tamper,
}

impl TamperingTransport {
    pub fn new(inner: Box<dyn Transport>, tamper: Tamper) -> Self {
        TamperingTransport { inner, tamper }
    }

    fn flip(message: &mut Message, offset: usize) {
        if let Ok(byte) = message.slice_mut(offset..offset + 1) {
            byte[0] ^= 0xff;
        }
    }

    fn apply(&self, message: &mut Message) {
        match self.tamper {
            Tamper::InArgsByte(offset) => {
                if let Ok(layout) = ProcessLayout::locate(message) {
                    Self::flip(message, layout.in_args.start + offset);
                }
            }
            Tamper::OutArgsSize(size) => {
                if let Ok(layout) = ProcessLayout::locate(message) {
                    let _ = message.write_u32(layout.out_args.start, size);
                }
            }
            Tamper::ParamsByte(offset) => {
                if let Ok(layout) = ControlLayout::locate(message) {
                    Self::flip(message, layout.params.start + offset);
                }
            }
            Tamper::StatusSize(size) => {
                if let Ok(layout) = ControlLayout::locate(message) {
                    let _ = message.write_u32(layout.status.start, size);
                }
            }
            Tamper::StatusBufferSize(offset, size) => {
                if let Ok(layout) = ControlLayout::locate(message) {
                    // size field of the descriptor follows its 64 bit address
                    let field = layout.status.start + offset + 8;
                    debug_assert!(offset + DESCRIPTOR_WIRE_SIZE <= layout.status.len());
                    let _ = message.write_u32(field, size);
                }
            }
            Tamper::Command(command) => message.set_command_raw(command),
        }
    }
}

impl Transport for TamperingTransport {
    fn allocate(&self) -> Option<Message> {
        self.inner.allocate()
    }

    fn free(&self, message: Message) {
        self.inner.free(message)
    }

    fn call_blocking(&mut self, message: Message) -> Result<Message, TransportError> {
        let mut reply = self.inner.call_blocking(message)?;
        self.apply(&mut reply);
        Ok(reply)
    }

    fn call_non_blocking(&mut self, message: Message) -> Result<(), TransportError> {
        self.inner.call_non_blocking(message)
    }

    fn await_completion(&mut self, timeout: Timeout) -> Result<Option<Message>, TransportError> {
        let mut reply = self.inner.await_completion(timeout)?;
        if let Some(message) = reply.as_mut() {
            self.apply(message);
        }
        Ok(reply)
    }

    fn max_payload_size(&self) -> usize {
        self.inner.max_payload_size()
    }

    fn is_local(&self) -> bool {
        self.inner.is_local()
    }
}
