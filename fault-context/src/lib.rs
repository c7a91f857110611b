//! Portable types describing a fault caught on a task exception port.
//!
//! These are kept in their own crate so that code consuming a fault, eg. a
//! stack unwinder or a report writer, doesn't need to depend on the machinery
//! that actually intercepts it.

/// A handle to a thread in the current task.
///
/// On Macos this is a `thread_t`, ie. a send right to the thread's kernel
/// port, which can be used with `thread_get_state` and friends.
pub type ThreadHandle = u32;

/// The fault classes that can be intercepted.
///
/// The discriminants are the kernel's `exception_type_t` values from
/// `exception_types.h`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExceptionClass {
    /// Could not access memory. (SIGSEGV/SIGBUS)
    ///
    /// Code field contains `kern_return_t` describing error.
    /// Subcode field contains bad memory address.
    BadAccess = 1,
    /// Instruction failed. (SIGILL)
    ///
    /// Illegal or undefined instruction or operand.
    BadInstruction = 2,
    /// Arithmetic exception (SIGFPE)
    ///
    /// Exact nature of the exception is in code field.
    Arithmetic = 3,
    /// Software generated exception
    ///
    /// Codes 0 - 0xffff reserved to hardware.
    /// Codes 0x10000 - 0x1ffff reserved for OS emulation (Unix)
    Software = 5,
    /// Trace, breakpoint, etc
    Breakpoint = 6,
}

impl ExceptionClass {
    /// Every class this crate knows how to intercept
    pub const ALL: [Self; 5] = [
        Self::BadAccess,
        Self::BadInstruction,
        Self::Arithmetic,
        Self::Software,
        Self::Breakpoint,
    ];

    /// The `EXC_MASK_*` bit for this class
    #[inline]
    pub const fn mask(self) -> u32 {
        1 << (self as i32)
    }
}

impl TryFrom<i32> for ExceptionClass {
    type Error = i32;

    fn try_from(val: i32) -> Result<Self, Self::Error> {
        Ok(match val {
            1 => Self::BadAccess,
            2 => Self::BadInstruction,
            3 => Self::Arithmetic,
            5 => Self::Software,
            6 => Self::Breakpoint,
            unknown => return Err(unknown),
        })
    }
}

/// The information handed to a fault callback.
///
/// Only valid for the duration of the callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultContext {
    /// The raw exception type, one of the [`ExceptionClass`] discriminants
    /// for any exception port installed by this workspace
    pub kind: i32,
    /// The exception code
    pub code: i64,
    /// Optional subcode, eg. the faulting address for `EXC_BAD_ACCESS`
    pub subcode: Option<i64>,
    /// The thread that faulted. The kernel holds it until the fault is replied
    /// to, so it is safe to inspect.
    pub thread: ThreadHandle,
}

impl FaultContext {
    /// The class of the fault, if it is one we know about
    #[inline]
    pub fn class(&self) -> Option<ExceptionClass> {
        ExceptionClass::try_from(self.kind).ok()
    }
}

/// A stack unwinder for an arbitrary thread in the current task.
///
/// This is not implemented here, fault callbacks are expected to bring their
/// own, but it is the shape that the thread handle in a [`FaultContext`] is
/// meant to be used with.
pub trait Unwind {
    /// Fills `frames` with the return addresses of `thread`'s stack, innermost
    /// first, returning how many were written. The length of `frames` is the
    /// maximum number of frames that will be walked.
    fn unwind(&self, thread: ThreadHandle, frames: &mut [usize]) -> usize;
}
