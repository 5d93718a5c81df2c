//! Variable records, the global store, and scope overlays.
//!
//! A variable is either plain text or a computed entry backed by live engine
//! state. The store preserves insertion order so `.VARIABLES` reports names
//! in the order they were first defined.

use indexmap::IndexMap;
use std::sync::Arc;

/// Provenance of a variable binding. Governs assignment precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Never assigned.
    Undefined,
    /// Built-in default installed by the engine.
    Default,
    /// Imported from the process environment.
    Environment,
    /// Environment value promoted by an `override` assignment or `-e`.
    EnvironmentOverride,
    /// Assigned by a makefile.
    File,
    /// Supplied on the command line.
    CommandLine,
    /// Assigned with the `override` directive.
    Override,
    /// Installed by the engine for a single expansion (automatic variables).
    Automatic,
}

impl Origin {
    /// The keyword reported by the `origin` function.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Default => "default",
            Self::Environment => "environment",
            Self::EnvironmentOverride => "environment override",
            Self::File => "file",
            Self::CommandLine => "command line",
            Self::Override => "override",
            Self::Automatic => "automatic",
        }
    }
}

/// Live engine fields surfaced as variables.
///
/// Reading one of these consults engine state at expansion time rather than
/// a stored string; `.RECIPEPREFIX` and `.DEFAULT_GOAL` also accept writes
/// that update the backing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Computed {
    /// Working directory of the engine instance.
    Curdir,
    /// Current recipe-introduction character, empty for the default tab.
    RecipePrefix,
    /// Space-joined list of all defined variable names.
    VariableNames,
    /// Directories searched by `include`.
    IncludeDirs,
    /// Constant feature list.
    Features,
    /// The live suffix list driving old-style suffix rules.
    Suffixes,
    /// The goal built when none is requested.
    DefaultGoal,
    /// Exit status of the most recent `shell` call or `!=` assignment.
    ShellExit,
    /// Every makefile parsed so far, in parse order.
    MakefileList,
    /// Recursion depth of this engine instance.
    MakeLevel,
}

/// Stored value: literal text or a computed hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Ordinary text, expanded on read when the flavor is recursive.
    Text(String),
    /// Live view onto engine state.
    Computed(Computed),
}

/// A single variable binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableValue {
    /// The stored value.
    pub payload: Payload,
    /// Where the binding came from.
    pub origin: Origin,
    /// Recursive flavor: re-expand on every read.
    pub recursive: bool,
    /// Hidden from the scopes of prerequisites.
    pub private: bool,
    /// Export to recipe environments. `None` follows the global
    /// `.EXPORT_ALL_VARIABLES` setting.
    pub export: Option<bool>,
}

impl VariableValue {
    /// A plain recursive variable with the given origin.
    #[must_use]
    pub fn text(value: impl Into<String>, origin: Origin, recursive: bool) -> Self {
        Self {
            payload: Payload::Text(value.into()),
            origin,
            recursive,
            private: false,
            export: None,
        }
    }

    /// A computed entry. Computed entries are never recursive; their text is
    /// produced by the engine on demand.
    #[must_use]
    pub fn computed(hook: Computed) -> Self {
        Self {
            payload: Payload::Computed(hook),
            origin: Origin::Default,
            recursive: false,
            private: false,
            export: Some(false),
        }
    }

    /// Whether the entry is backed by live engine state.
    #[must_use]
    pub fn is_computed(&self) -> bool {
        matches!(self.payload, Payload::Computed(_))
    }

    /// The flavor keyword reported by the `flavor` function.
    #[must_use]
    pub fn flavor(&self) -> &'static str {
        if self.recursive { "recursive" } else { "simple" }
    }
}

/// Name-to-value map preserving first-definition order.
pub type Variables = IndexMap<String, VariableValue>;

/// The global variable store.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    entries: Variables,
}

impl VariableStore {
    /// Look up a binding by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.entries.get(name)
    }

    /// Mutable lookup, used by assignment to update records in place.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut VariableValue> {
        self.entries.get_mut(name)
    }

    /// Insert or replace a binding.
    pub fn set(&mut self, name: impl Into<String>, value: VariableValue) {
        self.entries.insert(name.into(), value);
    }

    /// Remove a binding, as the `undefine` directive does.
    pub fn remove(&mut self, name: &str) -> Option<VariableValue> {
        self.entries.shift_remove(name)
    }

    /// All names in definition order, for `.VARIABLES`.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Iterate over every binding in definition order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &VariableValue)> {
        self.entries.iter()
    }
}

/// One overlay frame in a scope chain.
#[derive(Debug)]
struct Frame {
    vars: Variables,
    /// Set on the boundary a prerequisite crosses: private entries in this
    /// frame and all outer frames become invisible.
    hide_private: bool,
    parent: Option<Arc<Frame>>,
}

/// Immutable chain of variable overlays consulted before the global store.
///
/// Cloning is cheap (an `Arc` bump), so concurrent target builds can each
/// carry their own view. `with` and `without_private` return fresh chains
/// and never mutate the receiver.
#[derive(Debug, Clone, Default)]
pub struct ScopeChain {
    head: Option<Arc<Frame>>,
}

impl ScopeChain {
    /// The empty chain: lookups fall through to the global store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new chain with `overlay` consulted first.
    ///
    /// An empty overlay is skipped rather than pushed, keeping lookup chains
    /// short when a target has no specific scope.
    #[must_use]
    pub fn with(&self, overlay: Variables) -> Self {
        if overlay.is_empty() {
            return self.clone();
        }
        Self {
            head: Some(Arc::new(Frame {
                vars: overlay,
                hide_private: false,
                parent: self.head.clone(),
            })),
        }
    }

    /// A view of the same chain that hides private entries, used when a
    /// target's scope propagates to its prerequisites.
    #[must_use]
    pub fn without_private(&self) -> Self {
        match &self.head {
            None => Self::default(),
            Some(head) => Self {
                head: Some(Arc::new(Frame {
                    vars: Variables::new(),
                    hide_private: true,
                    parent: Some(Arc::clone(head)),
                })),
            },
        }
    }

    /// Look up `name` in the overlay frames, innermost first.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        let mut hidden = false;
        let mut frame = self.head.as_deref();
        while let Some(f) = frame {
            hidden |= f.hide_private;
            if let Some(value) = f.vars.get(name) {
                if hidden && value.private {
                    return None;
                }
                return Some(value);
            }
            frame = f.parent.as_deref();
        }
        None
    }

    /// Every binding visible through this chain, innermost wins. Used to
    /// snapshot the scope for `.EXPORT_ALL_VARIABLES`.
    #[must_use]
    pub fn flatten(&self) -> Variables {
        let mut out = Variables::new();
        let mut frames = Vec::new();
        let mut frame = self.head.as_deref();
        while let Some(f) = frame {
            frames.push(f);
            frame = f.parent.as_deref();
        }
        for f in frames.into_iter().rev() {
            for (name, value) in &f.vars {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }
}
