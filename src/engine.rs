//! The engine instance: state owner and parse/run entry points.
//!
//! All mutable engine state lives in [`EngineState`] behind a single mutex.
//! Parsing locks it once for the whole load; the runner locks it briefly for
//! each in-memory step so that only recipe execution blocks concurrently.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use camino::Utf8PathBuf;
use tracing::debug;

use crate::caps::Capabilities;
use crate::error::{MakeError, Result, SourceLocation};
use crate::expand::ExpandCtx;
use crate::parse;
use crate::rules::{RuleEntry, ScopeEntry, VpathEntry};
use crate::run::{self, RunOptions};
use crate::vars::{Computed, Origin, ScopeChain, VariableStore, VariableValue};

/// Feature keywords reported through `.FEATURES`.
pub const FEATURES: &str = "target-specific pattern-specific order-only second-expansion \
     else-if shortest-stem undefine oneshell grouped-target wait notparallel";

/// Version string reported through `MAKE_VERSION`.
pub const VERSION: &str = "4.4.1";

/// Default suffix list seeded into `.SUFFIXES`.
const DEFAULT_SUFFIXES: &[&str] = &[".o", ".c", ".cc", ".cpp", ".s", ".sh", ".y", ".l"];

/// Construction-time settings for an [`Engine`].
#[derive(Debug, Default)]
pub struct EngineConfig {
    /// Working directory; defaults to the process directory.
    pub curdir: Option<Utf8PathBuf>,
    /// Environment snapshot imported as `environment`-origin variables.
    pub env: Vec<(String, String)>,
    /// Environment bindings shadow makefile assignments (`-e`).
    pub env_overrides: bool,
    /// Directories searched by `include`.
    pub include_dirs: Vec<Utf8PathBuf>,
    /// Emit a warning on the first read of each undefined variable.
    pub warn_undef: bool,
    /// Recursion depth surfaced as `MAKELEVEL`.
    pub make_level: u32,
}

/// Everything the parser writes and the runner reads.
#[derive(Debug)]
pub struct EngineState {
    /// Global variables.
    pub vars: VariableStore,
    /// Rule headers in declaration order, pre-expansion.
    pub entries: Vec<RuleEntry>,
    /// Target- and pattern-specific variable scopes.
    pub scopes: Vec<ScopeEntry>,
    /// `vpath` mappings in declaration order.
    pub vpaths: Vec<VpathEntry>,
    /// Live suffix list.
    pub suffixes: Vec<String>,
    /// Recipe-introduction override set through `.RECIPEPREFIX`.
    pub recipe_prefix: Option<char>,
    /// Goal used when `run` receives none, explicit or inferred.
    pub default_goal: Option<String>,
    /// Engine working directory.
    pub curdir: Utf8PathBuf,
    /// Search path for `include`.
    pub include_dirs: Vec<Utf8PathBuf>,
    /// Every makefile parsed so far.
    pub makefile_list: Vec<String>,
    /// `-include` paths that failed to load, retried as goals at run start.
    pub deferred_includes: Vec<(String, SourceLocation)>,
    /// `.EXPORT_ALL_VARIABLES` / bare `export` toggle.
    pub export_all: bool,
    /// Environment bindings shadow makefile assignments.
    pub env_overrides: bool,
    /// Exit status of the most recent `shell` call or `!=` assignment.
    pub shell_exit: i32,
    /// Recursion depth of this instance.
    pub make_level: u32,
    /// Warn on first read of undefined names.
    pub warn_undef: bool,
    /// Names already warned about, so each warns once.
    pub warned_undef: HashSet<String>,
}

impl EngineState {
    fn new(config: &EngineConfig) -> Self {
        let curdir = config.curdir.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .ok()
                .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
                .unwrap_or_else(|| Utf8PathBuf::from("."))
        });
        let mut state = Self {
            vars: VariableStore::default(),
            entries: Vec::new(),
            scopes: Vec::new(),
            vpaths: Vec::new(),
            suffixes: DEFAULT_SUFFIXES.iter().map(ToString::to_string).collect(),
            recipe_prefix: None,
            default_goal: None,
            curdir,
            include_dirs: config.include_dirs.clone(),
            makefile_list: Vec::new(),
            deferred_includes: Vec::new(),
            export_all: false,
            env_overrides: config.env_overrides,
            shell_exit: 0,
            make_level: config.make_level,
            warn_undef: config.warn_undef,
            warned_undef: HashSet::new(),
        };
        state.seed_builtins();
        state.import_environment(&config.env);
        state
    }

    fn seed_builtins(&mut self) {
        let computed = [
            ("CURDIR", Computed::Curdir),
            (".RECIPEPREFIX", Computed::RecipePrefix),
            (".VARIABLES", Computed::VariableNames),
            (".INCLUDE_DIRS", Computed::IncludeDirs),
            (".FEATURES", Computed::Features),
            (".SUFFIXES", Computed::Suffixes),
            (".DEFAULT_GOAL", Computed::DefaultGoal),
            (".SHELLEXIT", Computed::ShellExit),
            ("MAKEFILE_LIST", Computed::MakefileList),
            ("MAKELEVEL", Computed::MakeLevel),
        ];
        for (name, hook) in computed {
            self.vars.set(name, VariableValue::computed(hook));
        }
        let host = format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS);
        let defaults = [
            ("SHELL", "/bin/sh"),
            ("MAKESHELL", "/bin/sh"),
            (".SHELLFLAGS", "-c"),
            ("MAKE", "make"),
            ("MAKE_VERSION", VERSION),
            ("MAKE_HOST", host.as_str()),
        ];
        for (name, value) in defaults {
            self.vars
                .set(name, VariableValue::text(value, Origin::Default, false));
        }
    }

    /// Import the environment snapshot. `SHELL` is deliberately skipped, as
    /// in Make, so recipes are not run by whatever interactive shell the
    /// caller happens to use.
    fn import_environment(&mut self, env: &[(String, String)]) {
        for (name, value) in env {
            if name == "SHELL" {
                continue;
            }
            self.vars
                .set(name, VariableValue::text(value, Origin::Environment, true));
        }
    }

    /// Look up `name` through `scope`, then the global store.
    #[must_use]
    pub fn lookup<'a>(&'a self, scope: &'a ScopeChain, name: &str) -> Option<&'a VariableValue> {
        scope.get(name).or_else(|| self.vars.get(name))
    }

    /// Render a computed entry against current state.
    #[must_use]
    pub fn computed_text(&self, hook: Computed) -> String {
        match hook {
            Computed::Curdir => self.curdir.to_string(),
            Computed::RecipePrefix => self.recipe_prefix.map(String::from).unwrap_or_default(),
            Computed::VariableNames => self.vars.names().join(" "),
            Computed::IncludeDirs => self
                .include_dirs
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            Computed::Features => FEATURES.to_owned(),
            Computed::Suffixes => self.suffixes.join(" "),
            Computed::DefaultGoal => self.default_goal.clone().unwrap_or_default(),
            Computed::ShellExit => self.shell_exit.to_string(),
            Computed::MakefileList => self.makefile_list.join(" "),
            Computed::MakeLevel => self.make_level.to_string(),
        }
    }

    /// Store a write to a computed entry into its backing field.
    ///
    /// Only `.RECIPEPREFIX` and `.DEFAULT_GOAL` accept writes; the rest are
    /// read-only views and the write is dropped with a debug note.
    pub fn computed_write(&mut self, hook: Computed, value: &str) {
        match hook {
            Computed::RecipePrefix => {
                self.recipe_prefix = value.chars().next();
            }
            Computed::DefaultGoal => {
                let trimmed = value.trim();
                self.default_goal = (!trimmed.is_empty()).then(|| trimmed.to_owned());
            }
            other => {
                debug!(target: "kumade::parse", ?other, "write to read-only builtin ignored");
            }
        }
    }

    /// Record the first eligible target as the inferred default goal.
    ///
    /// Special targets (leading dot) and pattern targets never qualify.
    pub fn note_default_goal(&mut self, target: &str) {
        if self.default_goal.is_none() && !target.starts_with('.') && !target.contains('%') {
            self.default_goal = Some(target.to_owned());
        }
    }
}

/// An embeddable build engine instance.
///
/// The engine holds no process-global state; several instances can coexist,
/// each with its own variable store, rule set, and capabilities.
pub struct Engine {
    state: Mutex<EngineState>,
    caps: Capabilities,
}

impl Engine {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new(caps: Capabilities) -> Self {
        Self::with_config(caps, &EngineConfig::default())
    }

    /// Create an engine with explicit configuration.
    #[must_use]
    pub fn with_config(caps: Capabilities, config: &EngineConfig) -> Self {
        Self {
            state: Mutex::new(EngineState::new(config)),
            caps,
        }
    }

    /// The injected capability set.
    #[must_use]
    pub fn caps(&self) -> &Capabilities {
        &self.caps
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Parse makefile text under the given display name.
    ///
    /// # Errors
    ///
    /// Returns a [`MakeError::Parse`] with file and line context on any
    /// malformed construct, and propagates mandatory include failures.
    pub fn parse_str(&self, text: &str, name: Option<&Utf8PathBuf>) -> Result<()> {
        let mut state = self.lock_state();
        if let Some(name) = name {
            state.makefile_list.push(name.to_string());
        }
        parse::parse_source(&mut state, &self.caps, text, name.cloned())
    }

    /// Read and parse a makefile through the include loader.
    ///
    /// # Errors
    ///
    /// Returns [`MakeError::Include`] when the file cannot be read, and any
    /// parse error from its contents.
    pub fn parse_file(&self, path: &Utf8PathBuf) -> Result<()> {
        let text = self
            .caps
            .includes
            .load(path.as_str(), &[])
            .map_err(|source| MakeError::Include {
                location: SourceLocation::default(),
                path: path.to_string(),
                source: std::sync::Arc::new(source),
            })?;
        self.parse_str(&text.1, Some(&text.0))
    }

    /// Install a command-line variable (`NAME=value` on the invocation).
    ///
    /// # Errors
    ///
    /// Propagates expansion failures from simple-flavored values.
    pub fn set_command_line_var(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.lock_state();
        let mut ctx = ExpandCtx::new(&mut state, &self.caps);
        parse::apply_simple_assignment(&mut ctx, name, value, Origin::CommandLine)
    }

    /// Expand a string against the current global scope.
    ///
    /// # Errors
    ///
    /// Propagates `$(error ...)` and function failures.
    pub fn expand(&self, text: &str) -> Result<String> {
        let mut state = self.lock_state();
        let mut ctx = ExpandCtx::new(&mut state, &self.caps);
        ctx.expand(text)
    }

    /// The current (expanded) value of a variable, if defined.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<String> {
        let mut state = self.lock_state();
        state.vars.get(name)?;
        let mut ctx = ExpandCtx::new(&mut state, &self.caps);
        ctx.expand(&format!("$({name})")).ok()
    }

    /// Bring `goals` up to date (the default goal when empty).
    ///
    /// Returns `true` when any recipe ran, or would have run under the
    /// dry-run and question modes.
    ///
    /// # Errors
    ///
    /// Propagates resolution and recipe failures; with `keep_going` set, a
    /// [`MakeError::KeepGoing`] summarising every failed target is returned
    /// after the rest of the graph has settled.
    pub fn run(&self, goals: &[String], options: RunOptions) -> Result<bool> {
        run::run(self, goals, options)
    }
}
