use crate::{
    message::{Message, MessagePool},
    skeleton::Skeleton,
    transport::{Timeout, Transport},
};
use crossbeam::channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError,
};
use log::{debug, error, trace, warn};
use remote_commons::{InstanceId, RemoteError, RemoteResult, TransportError, EFAIL};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
    thread::{spawn, JoinHandle},
};

enum DomainRequest {
    Create {
        instance: InstanceId,
        skeleton: Box<Skeleton>,
    },
    Call {
        instance: InstanceId,
        message: Message,
        reply: Sender<Message>,
    },
    Delete {
        instance: InstanceId,
    },
    Shutdown,
}

/// Execution domain on its own thread, optionally pinned to a core.
/// Instances are created, called and deleted through one request queue,
/// so requests of one instance are handled in the order they were sent.
pub struct RemoteDomain {
    requests: Sender<DomainRequest>,
    worker: Option<JoinHandle<()>>,
    next_instance: AtomicU32,
}

fn run_domain(core: Option<usize>, requests: Receiver<DomainRequest>) {
    if let Some(core_id) = core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id: core_id }) {
            error!("remote domain could not be pinned to core {}", core_id);
        }
    }
    let mut instances: HashMap<InstanceId, Box<Skeleton>> = HashMap::new();
    loop {
        let request = match requests.recv() {
            Ok(request) => request,
            // every handle and the domain itself are gone
            Err(_) => return,
        };
        match request {
            DomainRequest::Create { instance, skeleton } => {
                debug!("creating instance {} of {}", instance, skeleton.class().name);
                if instances.insert(instance, skeleton).is_some() {
                    warn!("instance {} was created twice, replaced the first", instance);
                }
            }
            DomainRequest::Call {
                instance,
                mut message,
                reply,
            } => {
                match instances.get_mut(&instance) {
                    Some(skeleton) => skeleton.call(&mut message),
                    None => {
                        warn!("call for unknown instance {}", instance);
                        message.set_status(EFAIL);
                    }
                }
                // the caller may have given up on the reply, the message goes back to the pool
                if reply.send(message).is_err() {
                    trace!("reply for instance {} was not collected", instance);
                }
            }
            DomainRequest::Delete { instance } => {
                debug!("deleting instance {}", instance);
                instances.remove(&instance);
            }
            DomainRequest::Shutdown => {
                debug!("remote domain shutting down with {} instances", instances.len());
                return;
            }
        }
    }
}

impl RemoteDomain {
    pub fn start(core: Option<usize>) -> Self {
        let (requests, receiver) = unbounded();
        let worker = spawn(move || run_domain(core, receiver));
        RemoteDomain {
            requests,
            worker: Some(worker),
            next_instance: AtomicU32::new(1),
        }
    }

    /// Bind a skeleton to a new instance in this domain, the returned transport
    /// carries the calls of exactly that instance
    pub fn create_instance(
        &self,
        skeleton: Skeleton,
        pool: MessagePool,
    ) -> RemoteResult<LoopbackTransport> {
        let instance = self.next_instance.fetch_add(1, Ordering::AcqRel);
        self.requests
            .send(DomainRequest::Create {
                instance,
                skeleton: Box::new(skeleton),
            })
            .map_err(|_| RemoteError::Transport(TransportError::Disconnected))?;
        Ok(LoopbackTransport {
            instance,
            pool,
            requests: self.requests.clone(),
            pending: None,
        })
    }
}

impl Drop for RemoteDomain {
    fn drop(&mut self) {
        let _ = self.requests.send(DomainRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("remote domain worker panicked");
            }
        }
    }
}

/// Transport of one instance inside a [`RemoteDomain`]
pub struct LoopbackTransport {
    instance: InstanceId,
    pool: MessagePool,
    requests: Sender<DomainRequest>,
    pending: Option<Receiver<Message>>,
}

impl LoopbackTransport {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    fn send(&mut self, message: Message) -> Result<Receiver<Message>, TransportError> {
        let (reply, receiver) = bounded(1);
        self.requests
            .send(DomainRequest::Call {
                instance: self.instance,
                message,
                reply,
            })
            .map_err(|_| TransportError::Disconnected)?;
        Ok(receiver)
    }
}

impl Transport for LoopbackTransport {
    fn allocate(&self) -> Option<Message> {
        self.pool.allocate()
    }

    fn free(&self, message: Message) {
        self.pool.free(message);
    }

    fn call_blocking(&mut self, message: Message) -> Result<Message, TransportError> {
        if self.pending.is_some() {
            return Err(TransportError::Rejected);
        }
        let receiver = self.send(message)?;
        receiver.recv().map_err(|_| TransportError::Disconnected)
    }

    fn call_non_blocking(&mut self, message: Message) -> Result<(), TransportError> {
        if self.pending.is_some() {
            return Err(TransportError::Rejected);
        }
        let receiver = self.send(message)?;
        self.pending = Some(receiver);
        Ok(())
    }

    fn await_completion(&mut self, timeout: Timeout) -> Result<Option<Message>, TransportError> {
        let receiver = match &self.pending {
            Some(receiver) => receiver,
            None => return Err(TransportError::Rejected),
        };
        let reply = match timeout {
            Timeout::Poll => match receiver.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    self.pending = None;
                    return Err(TransportError::Disconnected);
                }
            },
            Timeout::After(duration) => match receiver.recv_timeout(duration) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.pending = None;
                    return Err(TransportError::Disconnected);
                }
            },
            Timeout::Forever => match receiver.recv() {
                Ok(message) => Some(message),
                Err(_) => {
                    self.pending = None;
                    return Err(TransportError::Disconnected);
                }
            },
        };
        if reply.is_some() {
            self.pending = None;
        }
        Ok(reply)
    }

    fn max_payload_size(&self) -> usize {
        self.pool.message_size()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let _ = self.requests.send(DomainRequest::Delete {
            instance: self.instance,
        });
    }
}
