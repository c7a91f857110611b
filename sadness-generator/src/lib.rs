//! Raises each of the exception classes a fault handler intercepts, with known
//! operands so that the codes the kernel reports can be checked.

use std::arch::asm;

/// The address [`Sadness::BadAccess`] reads from. It is in the `__PAGEZERO`
/// segment, so it is never mapped.
pub const BAD_ACCESS_ADDRESS: usize = 0x42;

/// `KERN_INVALID_ADDRESS`, the code reported for a read of an unmapped address
pub const KERN_INVALID_ADDRESS: i64 = 1;
/// `EXC_I386_DIV`, the code reported for an integer divide by zero
pub const EXC_I386_DIV: i64 = 1;

/// The ways in which a program can be made sad
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sadness {
    /// Reads [`BAD_ACCESS_ADDRESS`]
    BadAccess,
    /// Executes an instruction that is defined to be undefined
    BadInstruction,
    /// Divides 1 by 0 with `idiv`. Only x86 traps on integer division by
    /// zero, arm just produces 0
    #[cfg(target_arch = "x86_64")]
    Arithmetic,
    /// Executes a breakpoint instruction
    Breakpoint,
}

impl Sadness {
    /// Makes the calling thread sad, the exact way depends on the flavor
    ///
    /// # Safety
    ///
    /// This is not safe. It intentionally crashes.
    pub unsafe fn make_sad(self) -> ! {
        unsafe {
            match self {
                Self::BadAccess => raise_bad_access(),
                Self::BadInstruction => raise_bad_instruction(),
                #[cfg(target_arch = "x86_64")]
                Self::Arithmetic => raise_arithmetic(),
                Self::Breakpoint => raise_breakpoint(),
            }
        }
    }
}

/// Raises `EXC_BAD_ACCESS` with a code of `KERN_INVALID_ADDRESS` and a
/// subcode of [`BAD_ACCESS_ADDRESS`]
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_bad_access() -> ! {
    let value = unsafe { std::ptr::read_volatile(BAD_ACCESS_ADDRESS as *const u8) };
    unreachable!("we read {value} from an unmapped address");
}

/// Raises `EXC_BAD_INSTRUCTION`
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_bad_instruction() -> ! {
    unsafe {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        asm!("ud2");
        #[cfg(target_arch = "aarch64")]
        asm!("udf #0");
    }

    unreachable!("executed an undefined instruction");
}

/// Raises `EXC_ARITHMETIC` with a code of `EXC_I386_DIV` and a subcode of 0
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
#[cfg(target_arch = "x86_64")]
pub unsafe fn raise_arithmetic() -> ! {
    let quotient: u32;
    unsafe {
        asm!(
            "mov eax, 1",
            "cdq",
            "mov {div:e}, 0",
            "idiv {div:e}",
            div = out(reg) _,
            out("eax") quotient,
            out("edx") _,
        );
    }

    unreachable!("1 / 0 = {quotient}");
}

/// Raises `EXC_BREAKPOINT`
///
/// # Safety
///
/// This is not safe. It intentionally crashes.
pub unsafe fn raise_breakpoint() -> ! {
    unsafe {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        asm!("int3");
        #[cfg(target_arch = "aarch64")]
        asm!("brk #1");
    }

    unreachable!("stepped over a breakpoint");
}
