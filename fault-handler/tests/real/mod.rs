#![allow(unsafe_code)]

use fault_handler as fh;

pub use fh::{ExceptionClass, FaultContext};
pub use sadness_generator::Sadness;

/// Installs the real exception port, then makes the test thread sad, checking
/// the context in the callback and exiting the process successfully if it
/// matched
pub fn handles_exception(sadness: Sadness, check: impl Fn(&FaultContext) + Send + Sync + 'static) {
    unsafe {
        fh::install(fh::make_fault_event(move |cc: &FaultContext| {
            check(cc);

            // The exception is handled on the monitor thread, so there is no
            // going back to the faulting one, and exiting here is the only way
            // to report success since there is only one test per binary
            #[allow(clippy::exit)]
            std::process::exit(0);
        }));

        assert!(fh::is_installed(), "is a debugger attached?");

        #[inline(never)]
        unsafe fn indirect(sadness: Sadness) {
            unsafe { sadness.make_sad() };
        }

        indirect(sadness);
    }

    panic!("this should be impossible");
}
