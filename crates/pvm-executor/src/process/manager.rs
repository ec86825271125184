use std::{
    collections::HashMap,
    io,
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    path::Path,
    process::{Command, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::{
    constants::process::{
        SIGNAL_EXIT_CODE, SPAWN_GRACE, TERMINATION_GRACE, TERMINATION_POLL_INTERVAL,
    },
    process::ProcessError,
};

/// A spawned sandbox child.
///
/// The handle is a plain record of the child's identity. The manager that spawned it decides
/// when the child is killed and reaped; the IPC endpoint itself is owned by whoever received it
/// from [`ChildProcessManager::spawn`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    /// The child's process id.
    pub pid: i32,
    /// Descriptor number of the controller's end of the IPC channel.
    pub ipc_fd: RawFd,
}

/// Signals the manager can deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// `SIGTERM`
    Terminate,
    /// `SIGKILL`
    Kill,
    /// `SIGINT`
    Interrupt,
}

impl Signal {
    const fn raw(self) -> libc::c_int {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Interrupt => libc::SIGINT,
        }
    }
}

/// Result of a non-blocking wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReapStatus {
    /// The child exited and has been reaped.
    Exited(i32),
    /// The child is still running.
    Running,
    /// There is no such child, it was reaped before.
    Gone,
}

/// Translates a raw wait status into an exit code, with signal deaths as [`SIGNAL_EXIT_CODE`].
fn exit_code(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        SIGNAL_EXIT_CODE
    }
}

/// Delivers `signal` to `pid`. A child that no longer exists is not an error.
fn send_signal(pid: i32, signal: Signal) {
    // SAFETY: kill has no memory safety preconditions.
    if unsafe { libc::kill(pid, signal.raw()) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(target: "pvm::process", pid, ?signal, %err, "failed to signal child");
        }
    }
}

/// Reaps `pid` if it has exited, without blocking.
fn try_reap(pid: i32) -> ReapStatus {
    loop {
        let mut status = 0;
        // SAFETY: `status` is a valid out pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rc == pid {
            return ReapStatus::Exited(exit_code(status));
        }
        if rc == 0 {
            return ReapStatus::Running;
        }
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return ReapStatus::Gone;
        }
    }
}

/// Blocks until `pid` exits and reaps it. `Ok(None)` means it was already reaped.
fn wait_blocking(pid: i32) -> io::Result<Option<i32>> {
    loop {
        let mut status = 0;
        // SAFETY: `status` is a valid out pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            return Ok(Some(exit_code(status)));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => {}
            Some(libc::ECHILD) => return Ok(None),
            _ => return Err(err),
        }
    }
}

/// The table of children a manager has spawned and not yet reaped, keyed by pid.
///
/// Shared with the [`ProcessGuard`]s of the manager, which must be able to reap after the
/// caller that spawned the child has gone away.
#[derive(Debug, Default, Clone)]
struct ProcessTable(Arc<Mutex<HashMap<i32, ProcessHandle>>>);

impl ProcessTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<i32, ProcessHandle>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn untrack(&self, pid: i32) {
        self.lock().remove(&pid);
    }

    /// Blocks until `pid` exits and forgets it as soon as it is reaped, so a reaped pid is never
    /// signalled through this table.
    fn wait_and_untrack(&self, pid: i32) -> io::Result<Option<i32>> {
        let outcome = wait_blocking(pid);
        if outcome.is_ok() {
            self.untrack(pid);
        }
        outcome
    }

    /// Kills a child nobody waits for any more and reaps it, on a blocking thread of the current
    /// runtime if there is one.
    fn abandon(&self, pid: i32) {
        {
            let table = self.lock();
            if !table.contains_key(&pid) {
                return;
            }
            send_signal(pid, Signal::Kill);
        }
        if try_reap(pid) != ReapStatus::Running {
            self.untrack(pid);
            return;
        }
        let table = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || table.wait_and_untrack(pid));
            }
            Err(_) => {
                let _ = table.wait_and_untrack(pid);
            }
        }
    }

    /// Waits up to `grace` for `pid` to exit, then kills and reaps it.
    async fn reap_with_grace(&self, pid: i32, grace: Duration) -> Option<i32> {
        let deadline = Instant::now() + grace;
        loop {
            match try_reap(pid) {
                ReapStatus::Exited(code) => {
                    self.untrack(pid);
                    return Some(code);
                }
                ReapStatus::Gone => {
                    self.untrack(pid);
                    return None;
                }
                ReapStatus::Running if Instant::now() >= deadline => break,
                ReapStatus::Running => tokio::time::sleep(TERMINATION_POLL_INTERVAL).await,
            }
        }
        warn!(target: "pvm::process", pid, "child ignored termination, sending SIGKILL");
        send_signal(pid, Signal::Kill);
        let table = self.clone();
        tokio::task::spawn_blocking(move || table.wait_and_untrack(pid))
            .await
            .ok()
            .and_then(Result::ok)
            .flatten()
    }
}

/// Kills and reaps a child if it is dropped while still armed.
///
/// Holding a guard across the awaits that talk to a child makes a cancelled caller safe: when
/// the future is dropped, so is the guard, and the child is killed and reaped instead of being
/// left running or as a zombie. A guard of a child that was already reaped does nothing.
#[derive(Debug)]
#[must_use = "dropping the guard kills the child"]
pub struct ProcessGuard {
    table: ProcessTable,
    handle: ProcessHandle,
    armed: bool,
}

impl ProcessGuard {
    /// The guarded child.
    pub const fn handle(&self) -> ProcessHandle {
        self.handle
    }

    /// Gives up the guard without touching the child, once it has been reaped or handed on.
    pub fn disarm(mut self) -> ProcessHandle {
        self.armed = false;
        self.handle
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!(target: "pvm::process", pid = self.handle.pid, "abandoned child, killing it");
            self.table.abandon(self.handle.pid);
        }
    }
}

/// Spawns sandbox children and guarantees none of them is leaked.
///
/// Every child the manager spawns is tracked until it has been reaped. Waiting, killing and
/// cleanup all reap what they stop, and dropping the manager kills and reaps whatever is left.
/// The process table belongs to this instance alone; its lifetime is the lifetime of the
/// executor or pool that owns the manager.
#[derive(Debug)]
pub struct ChildProcessManager {
    processes: ProcessTable,
    spawn_grace: Duration,
}

impl Default for ChildProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildProcessManager {
    /// Creates a manager with the default spawn grace period.
    pub fn new() -> Self {
        Self::with_spawn_grace(SPAWN_GRACE)
    }

    /// Creates a manager that waits `spawn_grace` after each spawn for the child to start serving.
    pub fn with_spawn_grace(spawn_grace: Duration) -> Self {
        Self { processes: ProcessTable::default(), spawn_grace }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<i32, ProcessHandle>> {
        self.processes.lock()
    }

    fn untrack(&self, pid: i32) {
        self.processes.untrack(pid);
    }

    /// Arms a [`ProcessGuard`] for `handle`, which kills and reaps the child if it is dropped
    /// before [`ProcessGuard::disarm`].
    pub fn guard(&self, handle: ProcessHandle) -> ProcessGuard {
        ProcessGuard { table: self.processes.clone(), handle, armed: true }
    }

    /// Whether `handle` is still tracked, i.e. not yet reaped.
    pub fn is_tracked(&self, handle: &ProcessHandle) -> bool {
        self.table().contains_key(&handle.pid)
    }

    /// Number of tracked children.
    pub fn tracked_count(&self) -> usize {
        self.table().len()
    }

    /// Spawns `executable` with a private channel on its standard input.
    ///
    /// The child gets one end of a fresh socket pair as descriptor 0, the null device as standard
    /// output and the parent's standard error. A relative `executable` is searched in `PATH`. The
    /// fork and exec happen inside [`Command::spawn`], whose child side only duplicates
    /// descriptors before replacing the image and exits immediately if that fails; a failed exec
    /// is reported here as [`ProcessError::Spawn`] and nothing is registered.
    ///
    /// # Returns
    ///
    /// The handle and the controller's end of the channel.
    pub async fn spawn(
        &self,
        executable: &Path,
    ) -> Result<(ProcessHandle, UnixStream), ProcessError> {
        let (parent_end, child_end) = UnixStream::pair().map_err(ProcessError::SocketPair)?;

        let child = {
            let mut command = Command::new(executable);
            command
                .stdin(Stdio::from(OwnedFd::from(child_end)))
                .stdout(Stdio::null())
                .stderr(Stdio::inherit());
            // dropping `command` closes the parent's copy of the child's end
            command.spawn()
        }
        .map_err(|source| ProcessError::Spawn { path: executable.to_path_buf(), source })?;

        let handle = ProcessHandle { pid: child.id() as i32, ipc_fd: parent_end.as_raw_fd() };
        // `Child` neither kills nor waits on drop; reaping is done by pid from here on.
        drop(child);
        self.table().insert(handle.pid, handle);
        debug!(target: "pvm::process", pid = handle.pid, path = %executable.display(), "spawned sandbox");

        // a caller cancelled during the grace period never sees the handle
        let guard = self.guard(handle);
        tokio::time::sleep(self.spawn_grace).await;
        Ok((guard.disarm(), parent_end))
    }

    /// Waits for the child to exit and reaps it.
    ///
    /// The wait blocks in the OS on a dedicated blocking thread rather than polling. If `timeout`
    /// expires the child receives `SIGTERM`, then `SIGKILL` after a grace period, is reaped, and
    /// [`ProcessError::Timeout`] is returned.
    ///
    /// # Returns
    ///
    /// The exit status, [`SIGNAL_EXIT_CODE`] if a signal ended the child, or `0` if it had
    /// already been reaped elsewhere.
    pub async fn wait_for_exit(
        &self,
        handle: ProcessHandle,
        timeout: Duration,
    ) -> Result<i32, ProcessError> {
        let pid = handle.pid;
        let table = self.processes.clone();
        let mut waiter = tokio::task::spawn_blocking(move || table.wait_and_untrack(pid));

        let outcome = match tokio::time::timeout(timeout, &mut waiter).await {
            Ok(joined) => match joined {
                Ok(Ok(code)) => Ok(code.unwrap_or(0)),
                Ok(Err(source)) => Err(ProcessError::Wait { pid, source }),
                Err(join_error) => Err(ProcessError::Wait { pid, source: io::Error::other(join_error) }),
            },
            Err(_) => {
                warn!(target: "pvm::process", pid, ?timeout, "child did not exit in time, terminating");
                send_signal(pid, Signal::Terminate);
                if tokio::time::timeout(TERMINATION_GRACE, &mut waiter).await.is_err() {
                    send_signal(pid, Signal::Kill);
                    let _ = waiter.await;
                }
                Err(ProcessError::Timeout { pid, timeout })
            }
        };

        self.untrack(pid);
        if let Ok(code) = &outcome {
            trace!(target: "pvm::process", pid, code, "child exited");
        }
        outcome
    }

    /// Delivers `signal` and reaps the child, escalating to `SIGKILL` if it outlives the grace
    /// period. A child that is already gone is treated as reaped.
    pub async fn kill(&self, handle: ProcessHandle, signal: Signal) {
        let pid = handle.pid;
        send_signal(pid, signal);
        let code = self.processes.reap_with_grace(pid, TERMINATION_GRACE).await;
        self.untrack(pid);
        debug!(target: "pvm::process", pid, ?signal, ?code, "killed sandbox");
    }

    /// Reaps the child if it has exited, without blocking.
    ///
    /// # Returns
    ///
    /// `true` if the child is gone, `false` if it is still running.
    pub fn reap(&self, handle: ProcessHandle) -> bool {
        match try_reap(handle.pid) {
            ReapStatus::Running => false,
            ReapStatus::Exited(_) | ReapStatus::Gone => {
                self.untrack(handle.pid);
                true
            }
        }
    }

    /// Reaps every tracked child that has exited.
    ///
    /// Only children spawned by this manager are waited on, so children owned by other parts of
    /// the process are never stolen.
    ///
    /// # Returns
    ///
    /// The number of children reaped.
    pub fn reap_zombies(&self) -> usize {
        let mut table = self.table();
        let before = table.len();
        table.retain(|pid, _| try_reap(*pid) == ReapStatus::Running);
        let reaped = before - table.len();
        if reaped > 0 {
            trace!(target: "pvm::process", reaped, "reaped exited children");
        }
        reaped
    }

    /// Terminates and reaps every tracked child.
    pub async fn cleanup(&self) {
        let handles: Vec<ProcessHandle> = self.table().values().copied().collect();
        if handles.is_empty() {
            return;
        }
        debug!(target: "pvm::process", count = handles.len(), "cleaning up sandbox children");
        for handle in &handles {
            send_signal(handle.pid, Signal::Terminate);
        }
        for handle in handles {
            self.processes.reap_with_grace(handle.pid, TERMINATION_GRACE).await;
            self.untrack(handle.pid);
        }
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        let pids: Vec<i32> = self.table().drain().map(|(pid, _)| pid).collect();
        for pid in pids {
            send_signal(pid, Signal::Kill);
            let _ = wait_blocking(pid);
        }
    }
}
