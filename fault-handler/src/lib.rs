// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:
#![allow(unsafe_code)]

//! Intercepts fatal exceptions raised in the current process before the
//! operating system's default termination path runs, executing a user callback
//! against a frozen snapshot of the process, before letting the fault proceed
//! exactly as it would have otherwise.
//!
//! # Exception ports
//!
//! On Macos, exceptions are first delivered as messages to the exception port
//! registered for the thread, then the task (process), and finally the host.
//! If no user ports have been registered the kernel converts the exception
//! into the equivalent Unix signal. This crate registers a task level port for
//!
//! - `EXC_BAD_ACCESS` (~`SIGSEGV`/`SIGBUS`)
//! - `EXC_BAD_INSTRUCTION` (~`SIGILL`)
//! - `EXC_ARITHMETIC` (~`SIGFPE`)
//! - `EXC_SOFTWARE` (~`SIGABRT` when raised via the kernel)
//! - `EXC_BREAKPOINT` (~`SIGTRAP`), unless the `ignore-debugger` feature is enabled
//!
//! and services it with a dedicated monitor thread. When an exception arrives,
//! every other thread is suspended, the callback is invoked, the threads are
//! resumed, the previously registered ports are restored, and the kernel is
//! told the exception was _not_ handled so that it continues on to the
//! previous handler, which is usually process termination.
//!
//! Each installation handles exactly one exception. Once an exception has
//! been caught the process state is not trustworthy, so the handler is never
//! re-armed automatically.
//!
//! # Debuggers
//!
//! Debuggers also rely on exception ports, so by default nothing is installed
//! if the process is being traced.
//!
//! # Kernel capabilities
//!
//! The lifecycle and protocol are written against the traits in [`kernel`]
//! rather than the kernel directly, the Macos implementation of which is
//! [`MachBackend`].

mod catch;
mod error;
mod installer;
pub mod kernel;
mod monitor;
mod port;

pub use error::Error;
pub use fault_context::{ExceptionClass, FaultContext, ThreadHandle, Unwind};
pub use installer::{Installer, Options, State};
pub use port::{EXC_TYPES_COUNT, ExceptionPortSet, PreviousPort};

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called while every other thread is suspended.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

/// User implemented trait for handling a fault that has occurred.
///
/// # Safety
///
/// This trait is marked unsafe as care needs to be taken when implementing it
/// due to [`Self::on_fault`] being run while every thread in the process,
/// other than the one running the callback, is suspended. Any lock held by a
/// suspended thread will never be released during the callback, which
/// includes locks inside the global allocator, stdio, and any logger, so
/// touching any of them can deadlock the process. Do as _little_ as possible,
/// with any allocations or other setup done before the handler is installed.
///
/// The callback is invoked at most once per installation, on the monitor
/// thread, and the fault is always forwarded to the previous handler once it
/// returns, regardless of what it did.
pub unsafe trait FaultEvent: Send + Sync {
    /// Method invoked when a fault occurs
    fn on_fault(&self, context: &FaultContext);
}

/// Creates a [`FaultEvent`] using the supplied closure as the implementation.
///
/// # Safety
///
/// See the [`FaultEvent`] Safety section for information on why this is `unsafe`.
#[inline]
pub unsafe fn make_fault_event<F>(closure: F) -> Box<dyn FaultEvent>
where
    F: Send + Sync + Fn(&FaultContext) + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> FaultEvent for Wrapper<F>
    where
        F: Send + Sync + Fn(&FaultContext),
    {
        fn on_fault(&self, context: &FaultContext) {
            (self.inner)(context);
        }
    }

    Box::new(Wrapper { inner: closure })
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod mac;

        pub use mac::{MachBackend, install, is_installed, uninstall};
    }
}
