use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Cooperative stop signal for server loops.
///
/// Clones share one flag. Inside a forked worker, SIGTERM also trips every
/// `Shutdown` in the process.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every loop holding a clone of this flag to stop.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || TERM_REQUESTED.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
extern "C" fn on_sigterm(_signal: libc::c_int) {
    TERM_REQUESTED.store(true, Ordering::SeqCst);
}

/// Route SIGTERM to the process-wide stop flag. Called in forked workers only.
#[cfg(unix)]
pub(crate) fn install_term_handler() -> std::io::Result<()> {
    // SAFETY: `action` is fully initialised before use, the handler only
    // performs an atomic store (async-signal-safe), and a null old-action
    // pointer is permitted by sigaction(2).
    let rc = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigterm as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut())
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
