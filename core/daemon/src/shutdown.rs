//! SIGINT/SIGTERM handling.
//!
//! The handler only flips an atomic flag; the accept loop and the health
//! probe poll it and wind down, and the store is released by the bootstrap's
//! shutdown guard.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn install_signal_handlers() -> Result<(), String> {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler performs a single atomic store, which is
        // async-signal-safe.
        let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(format!(
                "Failed to install handler for signal {}: {}",
                signal,
                std::io::Error::last_os_error()
            ));
        }
    }
    Ok(())
}

pub fn requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
