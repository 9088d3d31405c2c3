//! Process-global SIGINT flag.
//!
//! The handler only sets an atomic; the shard loop observes it at the
//! next tick boundary and performs a cooperative shutdown.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static SIGINT_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: i32) {
    SIGINT_PENDING.store(true, Ordering::Release);
}

/// Install the SIGINT handler. Call once at startup.
pub fn install_sigint_handler() -> std::io::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler is async-signal-safe (one atomic store).
    unsafe { sigaction(Signal::SIGINT, &action) }
        .map(|_| ())
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

/// True once SIGINT has been received.
pub fn sigint_pending() -> bool {
    SIGINT_PENDING.load(Ordering::Acquire)
}

/// Set the flag directly. Used by tests and embedders to request the
/// same cooperative shutdown SIGINT would.
pub fn request_shutdown() {
    SIGINT_PENDING.store(true, Ordering::Release);
}

/// Clear the flag (between tests, or after a handled shutdown).
pub fn clear() {
    SIGINT_PENDING.store(false, Ordering::Release);
}
