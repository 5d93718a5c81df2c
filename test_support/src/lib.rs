//! Test capabilities for kumade: an in-memory filesystem with controllable
//! mtimes, a recording shell spy, and an include loader over the same
//! store. End-to-end tests assemble these into a `Capabilities` set and
//! observe what the engine did without touching the host.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use kumade::caps::{
    Capabilities, FileSystem, IncludeLoader, OutputChunk, Shell, SpawnRequest,
};
use kumade::caps::real::HostPathResolver;

#[derive(Debug, Clone)]
struct FileEntry {
    content: String,
    mtime: i64,
}

/// In-memory filesystem keyed by path string, with a logical clock so
/// relative file ages are fully deterministic.
pub struct MemoryFs {
    files: Mutex<HashMap<String, FileEntry>>,
    clock: AtomicI64,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            clock: AtomicI64::new(100),
        }
    }

    /// Advance the logical clock and return the new time.
    pub fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Create or overwrite `path` at the next clock tick.
    pub fn put(&self, path: &str, content: &str) {
        let mtime = self.tick();
        self.put_at(path, content, mtime);
    }

    /// Create or overwrite `path` with an explicit mtime. The logical
    /// clock never runs behind an explicit stamp, so later `put` and
    /// `touch` calls always produce newer files.
    pub fn put_at(&self, path: &str, content: &str, mtime: i64) {
        self.clock.fetch_max(mtime, Ordering::SeqCst);
        self.files.lock().expect("fs lock").insert(
            path.to_owned(),
            FileEntry {
                content: content.to_owned(),
                mtime,
            },
        );
    }

    /// Current content of `path`, if present.
    #[must_use]
    pub fn contents(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .expect("fs lock")
            .get(path)
            .map(|entry| entry.content.clone())
    }

    /// Whether `path` exists at all.
    #[must_use]
    pub fn has(&self, path: &str) -> bool {
        self.files.lock().expect("fs lock").contains_key(path)
    }
}

impl FileSystem for MemoryFs {
    fn timestamp(&self, path: &str) -> i64 {
        self.files
            .lock()
            .expect("fs lock")
            .get(path)
            .map_or(0, |entry| entry.mtime)
    }

    fn timestamp_symlink(&self, path: &str) -> i64 {
        self.timestamp(path)
    }

    fn read_file(&self, path: &str) -> io::Result<String> {
        self.contents(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_owned()))
    }

    fn write_file(&self, path: &str, text: &str, append: bool) -> io::Result<()> {
        let mtime = self.tick();
        let mut files = self.files.lock().expect("fs lock");
        let entry = files.entry(path.to_owned()).or_insert(FileEntry {
            content: String::new(),
            mtime,
        });
        if append {
            entry.content.push_str(text);
        } else {
            entry.content = text.to_owned();
        }
        entry.mtime = mtime;
        Ok(())
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        self.files
            .lock()
            .expect("fs lock")
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_owned()))
    }

    fn touch(&self, path: &str) -> io::Result<()> {
        let mtime = self.tick();
        let mut files = self.files.lock().expect("fs lock");
        files
            .entry(path.to_owned())
            .and_modify(|entry| entry.mtime = mtime)
            .or_insert(FileEntry {
                content: String::new(),
                mtime,
            });
        Ok(())
    }

    fn realpath(&self, path: &str) -> Option<String> {
        self.has(path).then(|| path.to_owned())
    }

    fn glob(&self, pattern: &str, _cwd: &Utf8Path) -> Vec<String> {
        let mut regex = String::from("^");
        for ch in pattern.chars() {
            match ch {
                '*' => regex.push_str("[^/]*"),
                '?' => regex.push_str("[^/]"),
                other => regex.push_str(&regex::escape(&other.to_string())),
            }
        }
        regex.push('$');
        let Ok(matcher) = Regex::new(&regex) else {
            return Vec::new();
        };
        let files = self.files.lock().expect("fs lock");
        let mut matches: Vec<String> = files
            .keys()
            .filter(|name| matcher.is_match(name))
            .cloned()
            .collect();
        matches.sort();
        matches
    }
}

/// One observed shell invocation, with interleaving sequence numbers.
#[derive(Debug, Clone)]
pub struct ShellCall {
    /// The expanded command line.
    pub command: String,
    /// Interpreter the engine selected.
    pub shell: String,
    /// Environment handed to the child.
    pub env: Vec<(String, String)>,
    /// Global order at spawn time.
    pub started: u64,
    /// Global order at completion.
    pub finished: u64,
}

/// Scripted response for a spawn.
#[derive(Debug, Clone, Default)]
pub struct SpawnResult {
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
}

type SpawnHandler = Box<dyn Fn(&str) -> SpawnResult + Send + Sync>;

/// Shell spy: records every invocation, reports concurrency peaks, and
/// lets tests script behaviour per command line.
pub struct RecordingShell {
    calls: Mutex<Vec<ShellCall>>,
    sequence: AtomicU64,
    live: AtomicUsize,
    peak: AtomicUsize,
    delay: Mutex<Duration>,
    handler: Mutex<Option<SpawnHandler>>,
}

impl Default for RecordingShell {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingShell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            handler: Mutex::new(None),
        }
    }

    /// Script spawn behaviour; the closure sees the command line.
    pub fn on_spawn(&self, handler: impl Fn(&str) -> SpawnResult + Send + Sync + 'static) {
        *self.handler.lock().expect("handler lock") = Some(Box::new(handler));
    }

    /// Hold each spawn open for `delay`, making overlap observable.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = delay;
    }

    /// Every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ShellCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Commands recorded so far, in completion order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    /// Number of times a command containing `needle` ran.
    #[must_use]
    pub fn count_containing(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.command.contains(needle))
            .count()
    }

    /// Highest number of concurrently running spawns seen.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// The recorded call whose command contains `needle`.
    #[must_use]
    pub fn call_containing(&self, needle: &str) -> Option<ShellCall> {
        self.calls().into_iter().find(|c| c.command.contains(needle))
    }
}

impl Shell for RecordingShell {
    fn spawn(
        &self,
        request: &SpawnRequest<'_>,
        output: &mut dyn FnMut(OutputChunk<'_>),
    ) -> io::Result<i32> {
        let started = self.sequence.fetch_add(1, Ordering::SeqCst);
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().expect("delay lock");
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = self
            .handler
            .lock()
            .expect("handler lock")
            .as_ref()
            .map_or_else(SpawnResult::default, |h| h(request.command_line));

        self.live.fetch_sub(1, Ordering::SeqCst);
        let finished = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().expect("calls lock").push(ShellCall {
            command: request.command_line.to_owned(),
            shell: request.shell.to_owned(),
            env: request.env.to_vec(),
            started,
            finished,
        });
        if !result.stdout.is_empty() {
            output(OutputChunk::Stdout(&result.stdout));
        }
        if !result.stderr.is_empty() {
            output(OutputChunk::Stderr(&result.stderr));
        }
        Ok(result.exit)
    }
}

/// Include loader reading from a [`MemoryFs`].
pub struct MemoryIncludeLoader(pub Arc<MemoryFs>);

impl IncludeLoader for MemoryIncludeLoader {
    fn load(&self, name: &str, dirs: &[Utf8PathBuf]) -> io::Result<(Utf8PathBuf, String)> {
        if let Some(text) = self.0.contents(name) {
            return Ok((Utf8PathBuf::from(name), text));
        }
        for dir in dirs {
            let candidate = dir.join(name);
            if let Some(text) = self.0.contents(candidate.as_str()) {
                return Ok((candidate, text));
            }
        }
        Err(io::Error::new(io::ErrorKind::NotFound, name.to_owned()))
    }
}

/// Assemble a capability set over the shared in-memory filesystem and the
/// recording shell.
#[must_use]
pub fn capabilities(fs: &Arc<MemoryFs>, shell: &Arc<RecordingShell>) -> Capabilities {
    Capabilities {
        fs: Arc::clone(fs) as Arc<dyn FileSystem>,
        shell: Arc::clone(shell) as Arc<dyn Shell>,
        jobs: None,
        paths: Arc::new(HostPathResolver),
        includes: Arc::new(MemoryIncludeLoader(Arc::clone(fs))),
    }
}
