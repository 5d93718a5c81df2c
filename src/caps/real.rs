//! Host implementations of the capability contracts.
//!
//! These are what [`Capabilities::host`](super::Capabilities::host) wires
//! up: `std::fs` for stamps and file I/O, `std::process` for the shell with
//! output pumped back over a channel, and a condvar semaphore for job slots.

use std::io::{self, BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::{Condvar, Mutex, mpsc};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::debug;

use super::{FileSystem, IncludeLoader, JobServer, OutputChunk, PathResolver, Shell, SpawnRequest};
use crate::funcs::strings::stem_of;
use crate::rules::VpathEntry;

/// `std::fs`-backed filesystem.
pub struct HostFileSystem;

fn nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_nanos()).ok())
        // A file legitimately stamped at the epoch still has to read as
        // existing, so clamp to 1.
        .map_or(1, |n| n.max(1))
}

impl FileSystem for HostFileSystem {
    fn timestamp(&self, path: &str) -> i64 {
        std::fs::metadata(path)
            .and_then(|md| md.modified())
            .map(nanos)
            .unwrap_or(0)
    }

    fn timestamp_symlink(&self, path: &str) -> i64 {
        let direct = self.timestamp(path);
        let link = std::fs::symlink_metadata(path)
            .and_then(|md| md.modified())
            .map(nanos)
            .unwrap_or(0);
        direct.max(link)
    }

    fn read_file(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_file(&self, path: &str, text: &str, append: bool) -> io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(path)?;
        file.write_all(text.as_bytes())
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn touch(&self, path: &str) -> io::Result<()> {
        match std::fs::OpenOptions::new().append(true).open(path) {
            Ok(file) => file.set_modified(SystemTime::now()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                std::fs::write(path, b"")
            }
            Err(err) => Err(err),
        }
    }

    fn realpath(&self, path: &str) -> Option<String> {
        std::fs::canonicalize(path)
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    }

    fn glob(&self, pattern: &str, cwd: &Utf8Path) -> Vec<String> {
        let absolute = pattern.starts_with('/');
        let root = if absolute {
            Utf8PathBuf::from("/")
        } else {
            cwd.to_owned()
        };
        let components: Vec<&str> = pattern.split('/').filter(|c| !c.is_empty()).collect();
        let mut matches = expand_glob(&root, &components);
        matches.sort();
        if !absolute {
            // Report paths the way the pattern wrote them, not absolutely.
            let prefix = format!("{root}/");
            for m in &mut matches {
                if let Some(rel) = m.strip_prefix(&prefix) {
                    *m = rel.to_owned();
                }
            }
        }
        matches
    }
}

fn expand_glob(base: &Utf8Path, components: &[&str]) -> Vec<String> {
    let Some((head, rest)) = components.split_first() else {
        return vec![base.to_string()];
    };
    if !has_glob_chars(head) {
        let next = base.join(head);
        if next.as_std_path().exists() {
            return expand_glob(&next, rest);
        }
        return Vec::new();
    }
    let Ok(matcher) = glob_component_regex(head) else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(base.as_std_path()) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') && !head.starts_with('.') {
            continue;
        }
        if matcher.is_match(name) {
            out.extend(expand_glob(&base.join(name), rest));
        }
    }
    out
}

fn has_glob_chars(component: &str) -> bool {
    component.contains(['*', '?', '['])
}

/// Translate one glob component into an anchored regex.
fn glob_component_regex(component: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    let mut chars = component.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            '[' => {
                pattern.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    pattern.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if matches!(inner, '\\' | '^') {
                        pattern.push('\\');
                    }
                    pattern.push(inner);
                }
                pattern.push(']');
            }
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// `std::process`-backed shell launcher.
///
/// Output is pumped from the child on two reader threads and forwarded to
/// the caller's sink over a channel, so chunks arrive as the child produces
/// them rather than after it exits.
pub struct HostShell;

impl Shell for HostShell {
    fn spawn(
        &self,
        request: &SpawnRequest<'_>,
        output: &mut dyn FnMut(OutputChunk<'_>),
    ) -> io::Result<i32> {
        let mut cmd = Command::new(request.shell);
        cmd.args(request.shell_flags.split_whitespace());
        cmd.arg(request.command_line);
        cmd.current_dir(request.cwd.as_std_path());
        cmd.env_clear();
        cmd.envs(request.env.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(
            target: "kumade::run",
            shell = request.shell,
            command = request.command_line,
            "spawning recipe line"
        );
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<(bool, String)>();
        let tx_err = tx.clone();
        let out_pump = stdout.map(|stream| {
            thread::spawn(move || {
                for line in BufReader::new(stream).lines().map_while(Result::ok) {
                    if tx.send((false, line)).is_err() {
                        break;
                    }
                }
            })
        });
        let err_pump = stderr.map(|stream| {
            thread::spawn(move || {
                for line in BufReader::new(stream).lines().map_while(Result::ok) {
                    if tx_err.send((true, line)).is_err() {
                        break;
                    }
                }
            })
        });

        for (is_err, line) in rx {
            let text = format!("{line}\n");
            if is_err {
                output(OutputChunk::Stderr(&text));
            } else {
                output(OutputChunk::Stdout(&text));
            }
        }
        if let Some(handle) = out_pump {
            let _ = handle.join();
        }
        if let Some(handle) = err_pump {
            let _ = handle.join();
        }
        let status = child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Counting semaphore over a mutex and condvar.
pub struct SlotPool {
    free: Mutex<usize>,
    available: Condvar,
}

impl SlotPool {
    /// A pool admitting at most `max` concurrent holders.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            free: Mutex::new(max.max(1)),
            available: Condvar::new(),
        }
    }
}

impl JobServer for SlotPool {
    fn acquire_slot(&self) {
        let mut free = self.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while *free == 0 {
            free = self
                .available
                .wait(free)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *free -= 1;
    }

    fn release_slot(&self) {
        let mut free = self.free.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *free += 1;
        self.available.notify_one();
    }
}

/// `vpath`-directive search over the injected filesystem.
pub struct HostPathResolver;

impl PathResolver for HostPathResolver {
    fn resolve(
        &self,
        file: &str,
        vpaths: &[VpathEntry],
        general: &[String],
        fs: &dyn FileSystem,
    ) -> Option<String> {
        if fs.exists(file) {
            return Some(file.to_owned());
        }
        // Directive entries are consulted in declaration order, then the
        // general VPATH directories.
        for entry in vpaths {
            if stem_of(&entry.pattern, file).is_none() {
                continue;
            }
            for dir in &entry.directories {
                let candidate = format!("{}/{file}", dir.trim_end_matches('/'));
                if fs.exists(&candidate) {
                    return Some(candidate);
                }
            }
        }
        for dir in general {
            let candidate = format!("{}/{file}", dir.trim_end_matches('/'));
            if fs.exists(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Include resolution: the literal path first, then the search directories.
pub struct HostIncludeLoader;

impl IncludeLoader for HostIncludeLoader {
    fn load(&self, name: &str, dirs: &[Utf8PathBuf]) -> io::Result<(Utf8PathBuf, String)> {
        let direct = Utf8PathBuf::from(name);
        match std::fs::read_to_string(direct.as_std_path()) {
            Ok(text) => return Ok((direct, text)),
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            Err(_) => {}
        }
        if !direct.is_absolute() {
            for dir in dirs {
                let candidate = dir.join(name);
                if let Ok(text) = std::fs::read_to_string(candidate.as_std_path()) {
                    return Ok((candidate, text));
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such makefile: {name}"),
        ))
    }
}
