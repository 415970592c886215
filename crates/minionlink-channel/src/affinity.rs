//! Bind-before-fork worker management.
//!
//! A [`ProcessManager`] can only be built around a listener that is already
//! bound, so every forked worker inherits the same ready descriptor and the
//! kernel spreads incoming connections across them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use minionlink_transport::{Endpoint, WireListener};
use tracing::{debug, info, warn};

use crate::error::{ChannelError, Result};
use crate::shutdown::{install_term_handler, Shutdown};

/// Exit code of a worker whose closure panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

const REAP_POLL: Duration = Duration::from_millis(10);

/// What a forked worker gets to work with.
pub struct WorkerContext<'a> {
    index: usize,
    listener: &'a WireListener,
    shutdown: Shutdown,
}

impl<'a> WorkerContext<'a> {
    /// Zero-based spawn order of this worker.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The shared, already bound listener.
    pub fn listener(&self) -> &'a WireListener {
        self.listener
    }

    /// Trips when the manager sends SIGTERM.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

#[derive(Debug)]
struct Worker {
    pid: libc::pid_t,
    index: usize,
}

#[derive(Debug, Default)]
struct WorkerSet {
    workers: Vec<Worker>,
    spawned: usize,
}

/// Owns a bound listener and the worker processes forked to serve it.
///
/// Spawning, reaping and killing are serialized by one lock. Dropping the
/// manager shuts the workers down.
pub struct ProcessManager {
    listener: WireListener,
    wait_for_kill: Duration,
    workers: Mutex<WorkerSet>,
}

impl ProcessManager {
    /// Bind `endpoint` and wrap the listener. Fails with `Bind` if taken.
    pub fn bind(endpoint: &Endpoint, wait_for_kill: Duration) -> Result<Self> {
        let listener = WireListener::bind(endpoint)?;
        Ok(Self::from_listener(listener, wait_for_kill))
    }

    pub fn from_listener(listener: WireListener, wait_for_kill: Duration) -> Self {
        Self {
            listener,
            wait_for_kill,
            workers: Mutex::new(WorkerSet::default()),
        }
    }

    pub fn listener(&self) -> &WireListener {
        &self.listener
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.listener.endpoint()
    }

    pub fn wait_for_kill(&self) -> Duration {
        self.wait_for_kill
    }

    /// Pids of workers not yet reaped.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.lock()
            .workers
            .iter()
            .map(|w| w.pid as u32)
            .collect()
    }

    /// Fork one worker running `worker`. Returns its pid.
    ///
    /// The child runs `worker` and exits with its return code via `_exit`;
    /// it never returns into the caller. A panic exits with
    /// [`PANIC_EXIT_CODE`].
    pub fn spawn_worker<F>(&self, worker: F) -> Result<u32>
    where
        F: FnOnce(WorkerContext<'_>) -> i32,
    {
        let mut set = self.lock();
        let index = set.spawned;
        let parent = std::process::id();

        // SAFETY: fork has no memory-safety preconditions. The child only runs
        // `worker` and then `_exit`s, so it never unwinds into or returns to
        // state owned by the parent.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(ChannelError::Process(std::io::Error::last_os_error()));
        }
        if pid == 0 {
            run_child(index, parent, &self.listener, worker);
        }

        set.spawned += 1;
        set.workers.push(Worker { pid, index });
        info!(pid, index, endpoint = %self.listener.endpoint(), "spawned worker");
        Ok(pid as u32)
    }

    /// Fork `count` workers, each running a call of `worker`.
    pub fn spawn_workers<F>(&self, count: usize, worker: F) -> Result<Vec<u32>>
    where
        F: Fn(WorkerContext<'_>) -> i32,
    {
        (0..count).map(|_| self.spawn_worker(&worker)).collect()
    }

    /// Reap workers that already exited, without waiting.
    pub fn reap(&self) -> usize {
        let mut set = self.lock();
        let before = set.workers.len();
        set.workers.retain(|w| !try_reap(w));
        before - set.workers.len()
    }

    /// SIGTERM every worker, wait up to `wait_for_kill` for them to exit,
    /// then SIGKILL the rest.
    ///
    /// Returns `ShutdownTimeout` when any worker had to be force-killed;
    /// every worker is gone when this returns either way.
    pub fn shutdown(&self) -> Result<()> {
        let mut set = self.lock();
        if set.workers.is_empty() {
            return Ok(());
        }

        for worker in &set.workers {
            signal(worker.pid, libc::SIGTERM);
        }
        let started = Instant::now();
        loop {
            set.workers.retain(|w| !try_reap(w));
            if set.workers.is_empty() {
                info!(waited = ?started.elapsed(), "all workers exited");
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= self.wait_for_kill {
                break;
            }
            std::thread::sleep(REAP_POLL.min(self.wait_for_kill - waited));
        }

        let remaining = set.workers.len();
        let waited = started.elapsed();
        warn!(remaining, ?waited, "workers ignored SIGTERM, sending SIGKILL");
        for worker in set.workers.drain(..) {
            signal(worker.pid, libc::SIGKILL);
            wait_blocking(worker.pid);
        }
        Err(ChannelError::ShutdownTimeout { remaining, waited })
    }

    fn lock(&self) -> MutexGuard<'_, WorkerSet> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("endpoint", &self.listener.endpoint().to_string())
            .field("wait_for_kill", &self.wait_for_kill)
            .field("workers", &self.lock().workers)
            .finish()
    }
}

/// Bind `endpoint`, then fork `worker_count` workers sharing the listener.
pub fn bind_then_fork<F>(
    endpoint: &Endpoint,
    worker_count: usize,
    wait_for_kill: Duration,
    worker: F,
) -> Result<ProcessManager>
where
    F: Fn(WorkerContext<'_>) -> i32,
{
    let manager = ProcessManager::bind(endpoint, wait_for_kill)?;
    manager.spawn_workers(worker_count, worker)?;
    Ok(manager)
}

fn run_child<F>(index: usize, parent: u32, listener: &WireListener, worker: F) -> !
where
    F: FnOnce(WorkerContext<'_>) -> i32,
{
    let code = match install_term_handler() {
        Err(err) => {
            warn!(index, error = %err, "could not install SIGTERM handler");
            1
        }
        Ok(()) if !follow_parent(parent) => {
            debug!(index, "manager exited before the worker started");
            0
        }
        Ok(()) => {
            let ctx = WorkerContext {
                index,
                listener,
                shutdown: Shutdown::new(),
            };
            catch_unwind(AssertUnwindSafe(|| worker(ctx))).unwrap_or(PANIC_EXIT_CODE)
        }
    };
    debug!(index, code, "worker exiting");
    // SAFETY: `_exit` terminates the child immediately without running the
    // parent's atexit handlers or destructors, which belong to the parent.
    unsafe { libc::_exit(code) }
}

/// Ask the kernel to SIGTERM this worker when the thread that forked it
/// exits. False if the manager is already gone.
#[cfg(target_os = "linux")]
fn follow_parent(parent: u32) -> bool {
    // SAFETY: PR_SET_PDEATHSIG takes a plain signal number and touches no
    // memory of ours.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) };
    if rc != 0 {
        debug!(error = %std::io::Error::last_os_error(), "PR_SET_PDEATHSIG failed");
    }
    std::os::unix::process::parent_id() == parent
}

#[cfg(not(target_os = "linux"))]
fn follow_parent(parent: u32) -> bool {
    std::os::unix::process::parent_id() == parent
}

fn signal(pid: libc::pid_t, sig: libc::c_int) {
    // SAFETY: kill has no memory-safety preconditions; `pid` is one of our
    // unreaped children, so it cannot have been recycled.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        debug!(pid, sig, error = %std::io::Error::last_os_error(), "kill failed");
    }
}

/// True once `worker` has exited (or is no longer our child).
fn try_reap(worker: &Worker) -> bool {
    let mut status: libc::c_int = 0;
    // SAFETY: `status` is a valid writable int for the duration of the call.
    let rc = unsafe { libc::waitpid(worker.pid, &mut status, libc::WNOHANG) };
    match rc {
        0 => false,
        pid if pid == worker.pid => {
            debug!(pid, index = worker.index, status, "worker reaped");
            true
        }
        _ => {
            let err = std::io::Error::last_os_error();
            err.kind() != std::io::ErrorKind::Interrupted
        }
    }
}

fn wait_blocking(pid: libc::pid_t) {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid writable int for the duration of the call.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc >= 0 {
            return;
        }
        if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
            return;
        }
    }
}
