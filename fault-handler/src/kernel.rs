//! The kernel capabilities the exception port lifecycle is built on.
//!
//! These are deliberately narrow so that the install/uninstall lifecycle and
//! the catch protocol can be driven by something other than the real kernel,
//! the Macos implementation is [`crate::MachBackend`].

use crate::{Error, ExceptionPortSet};
pub use fault_context::ThreadHandle;

/// A port name in the current task's IPC space, `mach_port_t`
pub type PortName = u32;
/// A bitmask of `EXC_MASK_*` values, `exception_mask_t`
pub type ExceptionMask = u32;
/// How an exception is delivered to a port, `exception_behavior_t`
pub type Behavior = i32;
/// The thread state sent along with an exception, `thread_state_flavor_t`
pub type Flavor = i32;
/// `kern_return_t`
pub type KernReturn = i32;

pub const KERN_SUCCESS: KernReturn = 0;
/// The status we always reply with, meaning the exception was not handled and
/// the kernel should move on to the next handler
pub const KERN_FAILURE: KernReturn = 5;

/// Send a `catch_exception_raise` message including the identity.
pub const EXCEPTION_DEFAULT: Behavior = 1;
/// Send 64-bit code and subcode in the exception header.
///
/// Without this flag the code and subcode in the exception will be 32-bits,
/// losing eg. the upper half of the faulting address for `EXC_BAD_ACCESS`
pub const MACH_EXCEPTION_CODES: Behavior = 0x8000_0000_u32 as Behavior;

/// `mach_exception_raise` from `mach_exc.defs`, the id of exception messages
/// sent with `EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES`
pub const MACH_EXCEPTION_RAISE: i32 = 2405;

/// `MACH_MSGH_BITS_REMOTE_MASK` from `message.h`
const MSGH_BITS_REMOTE_MASK: u32 = 0x0000_001f;

/// The parts of a message header needed to reply to it
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub bits: u32,
    /// For a request, the port the reply is sent to
    pub remote_port: PortName,
    pub local_port: PortName,
    pub id: i32,
}

/// An exception message delivered by the kernel to the exception port
#[derive(Clone, Debug)]
pub struct FaultMessage {
    pub header: MessageHeader,
    /// The thread that raised the exception
    pub thread: ThreadHandle,
    /// The task that raised the exception
    pub task: PortName,
    /// The `exception_type_t`
    pub exception: i32,
    /// The number of valid entries in `code`
    pub code_count: u32,
    pub code: [i64; 2],
}

impl FaultMessage {
    /// The context handed to the user callback
    pub fn context(&self) -> fault_context::FaultContext {
        fault_context::FaultContext {
            kind: self.exception,
            code: self.code[0],
            subcode: (self.code_count > 1).then_some(self.code[1]),
            thread: self.thread,
        }
    }
}

/// A message received on the exception port
#[derive(Clone, Debug)]
pub enum Incoming {
    /// The kernel is delivering an exception
    Fault(FaultMessage),
    /// The monitor thread for the specified install generation should exit.
    ///
    /// The port outlives any one installation, so this can be stale.
    Shutdown { generation: u64 },
}

/// The reply to a [`FaultMessage`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultReply {
    pub header: MessageHeader,
    pub ret_code: KernReturn,
}

impl FaultReply {
    /// Builds a reply telling the kernel we did not handle the exception, so
    /// that it is delivered to the next handler in the chain.
    ///
    /// This magic incantation was derived from the `exc_server` generated by
    /// `mig -v /usr/include/mach/mach_exc.defs`
    pub fn not_handled(request: &FaultMessage) -> Self {
        Self {
            header: MessageHeader {
                bits: request.header.bits & MSGH_BITS_REMOTE_MASK,
                remote_port: request.header.remote_port,
                local_port: 0,
                id: request.header.id + 100,
            },
            ret_code: KERN_FAILURE,
        }
    }
}

/// Access to the current task's exception ports
pub trait TaskPorts {
    /// The current task, `mach_task_self`
    fn task(&self) -> PortName;

    /// Retrieves the currently registered ports for every exception in `mask`
    fn get_exception_ports(&self, mask: ExceptionMask) -> Result<ExceptionPortSet, Error>;

    /// Registers `port` for every exception in `mask`
    fn set_exception_ports(
        &self,
        mask: ExceptionMask,
        port: PortName,
        behavior: Behavior,
        flavor: Flavor,
    ) -> Result<(), Error>;

    /// Allocates a new port that the current task holds the receive right for
    fn allocate_receive_right(&self) -> Result<PortName, Error>;

    /// Gives the current task a send right to a port it holds the receive right for
    fn insert_send_right(&self, port: PortName) -> Result<(), Error>;
}

/// Scheduler level control over the threads of the current task
pub trait ThreadControl {
    /// The calling thread
    fn current(&self) -> ThreadHandle;

    /// Every thread in the current task, including the calling thread
    fn threads(&self) -> Result<Vec<ThreadHandle>, Error>;

    /// Forcibly suspends the thread, regardless of what it is doing
    fn suspend(&self, thread: ThreadHandle) -> Result<(), Error>;

    /// Undoes a previous [`Self::suspend`]
    fn resume(&self, thread: ThreadHandle) -> Result<(), Error>;

    /// Forcibly terminates the thread, no destructors or cleanup are run
    fn terminate(&self, thread: ThreadHandle) -> Result<(), Error>;
}

/// The receiving end of the exception port
pub trait ExceptionChannel: Send {
    /// Blocks until a message arrives on the port
    fn receive(&mut self) -> Result<Incoming, Error>;

    /// Replies to an exception message
    fn send(&self, reply: &FaultReply) -> Result<(), Error>;

    /// Enqueues an [`Incoming::Shutdown`] for the specified generation
    fn wake(&self, generation: u64) -> Result<(), Error>;

    /// Drops the thread and task rights carried by an exception message, once
    /// it has been replied to
    fn release(&self, request: &FaultMessage) -> Result<(), Error>;
}

/// Everything the installer needs from the kernel
pub trait Backend: Send + Sync + 'static {
    type Ports: TaskPorts;
    type Threads: ThreadControl;
    type Channel: ExceptionChannel + 'static;

    /// `THREAD_STATE_NONE` for the target architecture, we never ask for
    /// thread state to be sent with an exception
    const THREAD_STATE_NONE: Flavor;

    fn ports(&self) -> &Self::Ports;

    fn threads(&self) -> &Self::Threads;

    /// Opens the exception port for sending and receiving
    fn channel(&self, port: PortName) -> Self::Channel;

    /// True if the process is being traced, ie. a debugger is attached
    fn is_traced(&self) -> bool;
}
