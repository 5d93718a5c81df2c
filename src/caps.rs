//! Injected capability contracts.
//!
//! Every effect the engine performs goes through one of these traits, so
//! embedders and tests can substitute their own filesystem, shell, and
//! concurrency primitives. [`Capabilities::host`] wires up the real host
//! implementations from [`real`].

pub mod real;

use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::rules::VpathEntry;

/// Filesystem access for timestamps, recipe bookkeeping, and the `file`
/// and `wildcard` functions.
///
/// Timestamps are nanoseconds since the epoch, with `0` meaning the path
/// does not exist. Any monotone clamping (coarse filesystems, negative
/// mtimes) happens inside the implementation.
pub trait FileSystem: Send + Sync {
    /// Modification stamp of `path`, `0` when missing.
    fn timestamp(&self, path: &str) -> i64;

    /// Like [`FileSystem::timestamp`] but takes the max of the symlink
    /// itself and its referent, for `check_symlink` runs.
    fn timestamp_symlink(&self, path: &str) -> i64;

    /// Read a file to a string.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O failure.
    fn read_file(&self, path: &str) -> io::Result<String>;

    /// Create or overwrite (`append` false) or extend (`append` true).
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O failure.
    fn write_file(&self, path: &str, text: &str, append: bool) -> io::Result<()>;

    /// Remove a file, as `.DELETE_ON_ERROR` requires.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O failure.
    fn unlink(&self, path: &str) -> io::Result<()>;

    /// Create `path` or refresh its mtime, for touch mode.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O failure.
    fn touch(&self, path: &str) -> io::Result<()>;

    /// Canonical form of `path` when it exists.
    fn realpath(&self, path: &str) -> Option<String>;

    /// Expand a glob pattern relative to `cwd`, in directory order.
    fn glob(&self, pattern: &str, cwd: &Utf8Path) -> Vec<String>;

    /// Whether `path` exists at all.
    fn exists(&self, path: &str) -> bool {
        self.timestamp(path) != 0
    }
}

/// One streamed chunk of recipe output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChunk<'a> {
    /// A chunk from the child's stdout.
    Stdout(&'a str),
    /// A chunk from the child's stderr.
    Stderr(&'a str),
}

/// A command line ready to hand to the shell.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    /// The command text, already expanded.
    pub command_line: &'a str,
    /// Working directory for the child.
    pub cwd: &'a Utf8Path,
    /// Complete child environment.
    pub env: &'a [(String, String)],
    /// Shell interpreter (the `SHELL` variable).
    pub shell: &'a str,
    /// Flag word passed before the command (`.SHELLFLAGS`).
    pub shell_flags: &'a str,
}

/// Launches command lines through the host shell.
pub trait Shell: Send + Sync {
    /// Run the request, streaming output chunks as they arrive, and return
    /// the exit code.
    ///
    /// # Errors
    ///
    /// Returns the spawn failure when the interpreter cannot be launched.
    fn spawn(
        &self,
        request: &SpawnRequest<'_>,
        output: &mut dyn FnMut(OutputChunk<'_>),
    ) -> io::Result<i32>;
}

/// Bounded concurrency slots for recipe execution.
///
/// An implementation configured for `max` slots must never admit `max + 1`
/// concurrent holders. [`JobServer::acquire_slot`] blocks until a slot
/// frees up.
pub trait JobServer: Send + Sync {
    /// Block until a slot is available and claim it.
    fn acquire_slot(&self);
    /// Return a previously claimed slot.
    fn release_slot(&self);
}

/// RAII guard for a jobserver slot; releases on drop along every path.
pub struct JobSlot<'a>(&'a dyn JobServer);

impl Drop for JobSlot<'_> {
    fn drop(&mut self) {
        self.0.release_slot();
    }
}

/// Claim a slot from `server`, returning the releasing guard.
pub fn acquire(server: &dyn JobServer) -> JobSlot<'_> {
    server.acquire_slot();
    JobSlot(server)
}

/// `vpath`/`VPATH` search for prerequisites that are not plain files.
pub trait PathResolver: Send + Sync {
    /// Find an existing path for `file` under the vpath rules, or `None`
    /// to leave the name untouched.
    fn resolve(
        &self,
        file: &str,
        vpaths: &[VpathEntry],
        general: &[String],
        fs: &dyn FileSystem,
    ) -> Option<String>;
}

/// Resolves and reads files named by `include` directives.
pub trait IncludeLoader: Send + Sync {
    /// Locate `name` (searching `dirs` when relative) and read it.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O failure when the file cannot be found or
    /// read; `include` treats that as fatal and `-include` defers it.
    fn load(&self, name: &str, dirs: &[Utf8PathBuf]) -> io::Result<(Utf8PathBuf, String)>;
}

/// The full capability set handed to an engine.
#[derive(Clone)]
pub struct Capabilities {
    /// Filesystem access.
    pub fs: Arc<dyn FileSystem>,
    /// Recipe launcher.
    pub shell: Arc<dyn Shell>,
    /// Concurrency slots; `None` lets each run build its own semaphore
    /// sized from the `jobs` option.
    pub jobs: Option<Arc<dyn JobServer>>,
    /// `vpath` search.
    pub paths: Arc<dyn PathResolver>,
    /// `include` resolution.
    pub includes: Arc<dyn IncludeLoader>,
}

impl Capabilities {
    /// The host capability set backed by `std::fs` and `std::process`.
    #[must_use]
    pub fn host() -> Self {
        Self {
            fs: Arc::new(real::HostFileSystem),
            shell: Arc::new(real::HostShell),
            jobs: None,
            paths: Arc::new(real::HostPathResolver),
            includes: Arc::new(real::HostIncludeLoader),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::real::SlotPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn job_slot_releases_on_drop() {
        let pool = SlotPool::new(1);
        {
            let _slot = acquire(&pool);
        }
        // A second acquisition must not block once the first is dropped.
        let _again = acquire(&pool);
    }

    #[test]
    fn slot_pool_never_exceeds_capacity() {
        let pool = Arc::new(SlotPool::new(2));
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let pool = Arc::clone(&pool);
                let live = Arc::clone(&live);
                let peak = Arc::clone(&peak);
                scope.spawn(move || {
                    let _slot = acquire(pool.as_ref());
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
