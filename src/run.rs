//! The build runner: DAG traversal, rebuild decisions, parallel
//! scheduling, and recipe dispatch.
//!
//! Each target builds at most once per run through a shared build cell;
//! concurrent requests for the same target wait on the first. Prerequisite
//! segments split by `.WAIT` settle fully before the next segment starts.

pub mod recipe;
pub mod stamps;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use itertools::Itertools;
use tracing::{debug, warn};

use crate::caps::JobServer;
use crate::caps::real::SlotPool;
use crate::engine::Engine;
use crate::error::{MakeError, Result};
use crate::expand::ExpandCtx;
use crate::parse;
use crate::resolve::{Resolution, Resolver};
use crate::rules::{Rule, RuleTable, WAIT, split_prerequisites};
use crate::vars::{Origin, ScopeChain, VariableValue, Variables};

use recipe::AutomaticInputs;
use stamps::StampCache;

/// Chunk sink for recipe output.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// What the runner does with out-of-date targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Execute recipes.
    #[default]
    Normal,
    /// Print recipes without executing them (`+` lines still run).
    DryRun,
    /// Report whether work is needed without doing any.
    Question,
    /// Touch target files instead of running recipes.
    Touch,
}

/// Deterministic prerequisite reordering for robustness testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shuffle {
    /// Reverse each segment.
    Reverse,
    /// Shuffle each segment from this seed.
    Seed(u64),
}

/// Output grouping for parallel recipe chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputSync {
    /// Forward chunks as they arrive.
    #[default]
    Stream,
    /// Buffer a whole recipe invocation, emit on completion.
    Target,
    /// Line-buffered, which the streamed chunks already are.
    Line,
    /// Pass-through for recursive invocations.
    Recurse,
}

/// Run-time configuration for one `run` call.
#[derive(Clone)]
pub struct RunOptions {
    /// Execution mode.
    pub mode: RunMode,
    /// Concurrency bound used when no jobserver capability is injected.
    pub jobs: usize,
    /// Advisory load ceiling; accepted for interface parity.
    pub max_load: Option<f64>,
    /// Rebuild everything regardless of timestamps.
    pub always: bool,
    /// Keep building unrelated goals after a failure.
    pub keep_going: bool,
    /// Ignore every recipe's exit status.
    pub ignore_errors: bool,
    /// Do not echo recipe lines.
    pub silent: bool,
    /// Echo even lines marked silent.
    pub no_silent: bool,
    /// Run every recipe as a single shell invocation.
    pub oneshell: bool,
    /// Stamp symlinks as the max of link and referent.
    pub check_symlink: bool,
    /// Paths treated as infinitely old.
    pub assume_old: Vec<String>,
    /// Paths treated as infinitely new.
    pub assume_new: Vec<String>,
    /// Prerequisite reordering.
    pub shuffle: Option<Shuffle>,
    /// Output grouping.
    pub output_sync: OutputSync,
    /// Chunk sink; process stdout/stderr when absent.
    pub output: Option<OutputSink>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Normal,
            jobs: 1,
            max_load: None,
            always: false,
            keep_going: false,
            ignore_errors: false,
            silent: false,
            no_silent: false,
            oneshell: false,
            check_symlink: false,
            assume_old: Vec::new(),
            assume_new: Vec::new(),
            shuffle: None,
            output_sync: OutputSync::Stream,
            output: None,
        }
    }
}

impl RunOptions {
    fn effective_jobs(&self) -> usize {
        self.jobs.max(1)
    }
}

type Outcome = std::result::Result<bool, MakeError>;

/// In-flight build state shared between the builder and any waiters.
struct BuildCell {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl BuildCell {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> Outcome {
        let mut outcome = self
            .outcome
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while outcome.is_none() {
            outcome = self
                .done
                .wait(outcome)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        outcome.clone().expect("outcome present after wait")
    }

    fn complete(&self, result: Outcome) {
        let mut outcome = self
            .outcome
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *outcome = Some(result);
        self.done.notify_all();
    }
}

/// Stack-linked chain of the targets currently being built, for
/// circular-dependency detection.
struct Ancestry<'a> {
    target: &'a str,
    parent: Option<&'a Ancestry<'a>>,
}

impl Ancestry<'_> {
    fn contains(&self, target: &str) -> bool {
        self.target == target || self.parent.is_some_and(|p| p.contains(target))
    }
}

/// Bring `goals` up to date. See [`Engine::run`].
///
/// # Errors
///
/// Propagates resolution and recipe failures; accumulates them under
/// `keep_going`.
pub fn run(engine: &Engine, goals: &[String], options: RunOptions) -> Result<bool> {
    let table = build_table(engine, goals)?;
    let jobs: Arc<dyn JobServer> = engine
        .caps()
        .jobs
        .clone()
        .unwrap_or_else(|| Arc::new(SlotPool::new(options.effective_jobs())));
    let stamps = StampCache::new(
        &options.assume_new,
        &options.assume_old,
        options.check_symlink,
    );
    let mut runner = Runner {
        engine,
        table,
        opts: options,
        jobs,
        stamps,
        visited: Mutex::new(HashMap::new()),
        cancelled: AtomicBool::new(false),
    };
    runner.satisfy_deferred_includes()?;

    let goals: Vec<String> = if goals.is_empty() {
        match engine.lock_state().default_goal.clone() {
            Some(goal) => vec![goal],
            None => {
                return Err(MakeError::User {
                    message: "no targets specified and no default goal".to_owned(),
                });
            }
        }
    } else {
        goals.to_vec()
    };

    let mut any_work = false;
    let mut failed: Vec<String> = Vec::new();
    for goal in &goals {
        match runner.build_target(goal, &ScopeChain::new(), None) {
            Ok(work) => any_work |= work,
            Err(err) if runner.opts.keep_going => {
                warn!(target: "kumade::run", goal, error = %err, "goal failed, continuing");
                failed.push(goal.clone());
            }
            Err(err) => return Err(err),
        }
        if runner.opts.mode == RunMode::Question && any_work {
            return Ok(true);
        }
    }
    if failed.is_empty() {
        Ok(any_work)
    } else {
        Err(MakeError::KeepGoing { failed })
    }
}

fn build_table(engine: &Engine, goals: &[String]) -> Result<RuleTable> {
    let mut state = engine.lock_state();
    state.vars.set(
        "MAKECMDGOALS",
        VariableValue::text(goals.join(" "), Origin::Automatic, false),
    );
    let caps = engine.caps().clone();
    let mut ctx = ExpandCtx::new(&mut state, &caps);
    RuleTable::build(&mut ctx)
}

struct Runner<'e> {
    engine: &'e Engine,
    table: RuleTable,
    opts: RunOptions,
    jobs: Arc<dyn JobServer>,
    stamps: StampCache,
    visited: Mutex<HashMap<String, Arc<BuildCell>>>,
    cancelled: AtomicBool,
}

impl Runner<'_> {
    /// Build the `-include` files that failed to load, re-parse any that
    /// appeared, and refresh the rule table.
    fn satisfy_deferred_includes(&mut self) -> Result<()> {
        let deferred: Vec<_> = {
            let mut state = self.engine.lock_state();
            state.deferred_includes.drain(..).collect()
        };
        if deferred.is_empty() {
            return Ok(());
        }
        let mut reloaded = false;
        for (name, _location) in &deferred {
            if let Err(err) = self.build_target(name, &ScopeChain::new(), None) {
                debug!(target: "kumade::run", name, error = %err, "deferred include not buildable");
            }
            let dirs = self.engine.lock_state().include_dirs.clone();
            if let Ok((path, text)) = self.engine.caps().includes.load(name, &dirs) {
                let mut state = self.engine.lock_state();
                state.makefile_list.push(path.to_string());
                parse::parse_source(&mut state, self.engine.caps(), &text, Some(path))?;
                reloaded = true;
            }
        }
        if reloaded {
            self.table = build_table_from_state(self.engine)?;
            self.visited
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clear();
        }
        Ok(())
    }

    fn build_target(
        &self,
        target: &str,
        parent_scope: &ScopeChain,
        ancestry: Option<&Ancestry<'_>>,
    ) -> Outcome {
        if let Some(chain) = ancestry
            && chain.contains(target)
        {
            warn!(
                target: "kumade::run",
                target_name = target,
                "circular dependency dropped"
            );
            return Ok(false);
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(false);
        }

        // Atomic check-or-insert: exactly one caller owns the build, the
        // rest wait on its cell.
        let (cell, owner) = {
            let mut visited = self
                .visited
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match visited.get(target) {
                Some(cell) => (Arc::clone(cell), false),
                None => {
                    let cell = Arc::new(BuildCell::new());
                    visited.insert(target.to_owned(), Arc::clone(&cell));
                    (cell, true)
                }
            }
        };
        if !owner {
            return cell.wait();
        }
        let outcome = self.perform(target, parent_scope, ancestry, &cell);
        cell.complete(outcome.clone());
        outcome
    }

    fn perform(
        &self,
        target: &str,
        parent_scope: &ScopeChain,
        ancestry: Option<&Ancestry<'_>>,
        cell: &Arc<BuildCell>,
    ) -> Outcome {
        let scope = parent_scope.with(self.table.scope_for(target));
        let resolution =
            Resolver::new(&self.table, self.engine.caps().fs.as_ref()).get_rule(target);
        match resolution {
            None => {
                if self.stamps.stamp(self.engine.caps().fs.as_ref(), target) != 0 {
                    Ok(false)
                } else {
                    Err(MakeError::NoRule {
                        target: target.to_owned(),
                        needed_by: ancestry.map(|a| a.target.to_owned()),
                    })
                }
            }
            Some(Resolution::Single(rule)) => {
                self.build_rule(target, &rule, &scope, ancestry, cell, None)
            }
            Some(Resolution::DoubleColon(rules)) => {
                // Each rule updates independently, but all of them decide
                // against the target's stamp from before any of them ran.
                let stamp = self.stamps.stamp(self.engine.caps().fs.as_ref(), target);
                let mut work = false;
                for rule in &rules {
                    work |= self.build_rule(target, rule, &scope, ancestry, cell, Some(stamp))?;
                }
                Ok(work)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn build_rule(
        &self,
        target: &str,
        rule: &Rule,
        scope: &ScopeChain,
        ancestry: Option<&Ancestry<'_>>,
        cell: &Arc<BuildCell>,
        fixed_stamp: Option<i64>,
    ) -> Outcome {
        // Grouped targets share this build: adopt the cell for every member
        // before prerequisites start. When two members were requested
        // concurrently and both got their own cell, the lexicographically
        // smaller name proceeds and the other waits on it, so the group
        // recipe still runs exactly once.
        if let Some(members) = &rule.targets {
            let mut visited = self
                .visited
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for member in members {
                if member == target {
                    continue;
                }
                match visited.get(member) {
                    None => {
                        visited.insert(member.clone(), Arc::clone(cell));
                    }
                    Some(existing) => {
                        if !Arc::ptr_eq(existing, cell) && member.as_str() < target {
                            let winner = Arc::clone(existing);
                            drop(visited);
                            return winner.wait();
                        }
                    }
                }
            }
        }

        let (prereqs, order_only) = self.expand_prerequisites(target, rule, scope)?;
        let (vpaths, general) = self.vpath_tables()?;
        let caps = self.engine.caps();
        let resolve = |name: &String| {
            if name == WAIT {
                name.clone()
            } else {
                self.stamps.resolve(caps, &vpaths, &general, name)
            }
        };
        let prereqs: Vec<String> = prereqs.iter().map(resolve).collect();
        let order_only: Vec<String> = order_only.iter().map(resolve).collect();
        let extras: Vec<String> = self
            .extra_prerequisites(scope)?
            .iter()
            .map(resolve)
            .collect();

        let work_prereqs = self.schedule_prerequisites(
            target,
            &prereqs,
            &order_only,
            &extras,
            scope,
            ancestry,
        )?;
        if self.opts.mode == RunMode::Question && work_prereqs {
            return Ok(true);
        }

        // Rebuild decision over the cached stamps.
        let fs = caps.fs.as_ref();
        let members: Vec<String> = rule
            .targets
            .clone()
            .unwrap_or_else(|| vec![target.to_owned()]);
        let phony = self.table.specials.phony.contains(target);
        let target_stamp = if phony {
            0
        } else if let Some(fixed) = fixed_stamp {
            fixed
        } else {
            members
                .iter()
                .map(|m| self.stamps.stamp(fs, m))
                .min()
                .unwrap_or(0)
        };
        let stamp_inputs: Vec<&String> = prereqs
            .iter()
            .filter(|p| *p != WAIT)
            .chain(extras.iter())
            .collect();
        let newest = stamp_inputs
            .iter()
            .map(|p| self.stamps.stamp(fs, p))
            .max()
            .unwrap_or(0);
        let newer: Vec<String> = prereqs
            .iter()
            .filter(|p| *p != WAIT)
            .filter(|p| target_stamp == 0 || self.stamps.stamp(fs, p) > target_stamp)
            .cloned()
            .unique()
            .collect();

        let mut rebuild = self.opts.always
            || rule.always_rebuild
            || target_stamp == 0
            || newest > target_stamp;
        if self.opts.mode != RunMode::Normal && work_prereqs {
            // Prerequisite recipes did not actually run, so their would-be
            // effects must be assumed.
            rebuild = true;
        }
        if !rebuild || rule.recipe.is_none() {
            debug!(
                target: "kumade::run",
                target_name = target,
                rebuild,
                has_recipe = rule.recipe.is_some(),
                "target up to date"
            );
            return Ok(work_prereqs);
        }

        match self.opts.mode {
            RunMode::Question => Ok(true),
            RunMode::Touch => {
                for member in &members {
                    fs.touch(member).map_err(|source| MakeError::FileIo {
                        op: "touch".to_owned(),
                        path: member.clone(),
                        source: std::sync::Arc::new(source),
                    })?;
                    if !self.opts.silent {
                        recipe::emit(&self.opts, &format!("touch {member}\n"), false);
                    }
                }
                self.stamps.invalidate();
                Ok(true)
            }
            RunMode::Normal | RunMode::DryRun => {
                let inputs = AutomaticInputs {
                    all: prereqs.iter().filter(|p| *p != WAIT).cloned().collect(),
                    newer,
                    order_only: order_only.clone(),
                    stem: rule.stem.clone(),
                };
                self.run_recipe(target, rule, scope, &inputs, &members)?;
                Ok(true)
            }
        }
    }

    /// Apply second expansion when enabled for this target.
    fn expand_prerequisites(
        &self,
        target: &str,
        rule: &Rule,
        scope: &ScopeChain,
    ) -> Result<(Vec<String>, Vec<String>)> {
        if !self.table.specials.second_expansion.contains(target) {
            return Ok((rule.prerequisites.clone(), rule.order_only.clone()));
        }
        let mut overlay = Variables::new();
        overlay.insert(
            "@".to_owned(),
            VariableValue::text(target, Origin::Automatic, false),
        );
        overlay.insert(
            "*".to_owned(),
            VariableValue::text(
                rule.stem.clone().unwrap_or_default(),
                Origin::Automatic,
                false,
            ),
        );
        let caps = self.engine.caps().clone();
        let mut state = self.engine.lock_state();
        let mut ctx = ExpandCtx::with_scope(&mut state, &caps, scope.with(overlay));
        let normal = ctx.expand(&rule.prerequisites.join(" "))?;
        let order = ctx.expand(&rule.order_only.join(" "))?;
        let (prereqs, mut order_only) = split_prerequisites(&normal);
        let (still_order, and_after_pipe) = split_prerequisites(&order);
        order_only.extend(still_order);
        order_only.extend(and_after_pipe);
        Ok((prereqs, order_only))
    }

    fn vpath_tables(&self) -> Result<(Vec<crate::rules::VpathEntry>, Vec<String>)> {
        let caps = self.engine.caps().clone();
        let mut state = self.engine.lock_state();
        let vpaths = state.vpaths.clone();
        let general = if state.vars.get("VPATH").is_some() {
            let mut ctx = ExpandCtx::new(&mut state, &caps);
            ctx.expand("$(VPATH)")?
                .split([' ', '\t', ':'])
                .filter(|d| !d.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        } else {
            Vec::new()
        };
        Ok((vpaths, general))
    }

    fn extra_prerequisites(&self, scope: &ScopeChain) -> Result<Vec<String>> {
        let caps = self.engine.caps().clone();
        let mut state = self.engine.lock_state();
        if state.lookup(scope, ".EXTRA_PREREQS").is_none() {
            return Ok(Vec::new());
        }
        let mut ctx = ExpandCtx::with_scope(&mut state, &caps, scope.clone());
        let text = ctx.expand("$(.EXTRA_PREREQS)")?;
        Ok(text.split_whitespace().map(ToOwned::to_owned).collect())
    }

    /// Build the prerequisite lists per the scheduling rules: sequential
    /// under `.NOTPARALLEL`, segmented by `.WAIT`, otherwise parallel.
    fn schedule_prerequisites(
        &self,
        target: &str,
        prereqs: &[String],
        order_only: &[String],
        extras: &[String],
        scope: &ScopeChain,
        ancestry: Option<&Ancestry<'_>>,
    ) -> Outcome {
        let mut segments: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        for prereq in prereqs {
            if prereq == WAIT {
                segments.push(std::mem::take(&mut current));
            } else {
                current.push(prereq.clone());
            }
        }
        current.extend(extras.iter().cloned());
        current.extend(order_only.iter().cloned());
        segments.push(current);

        let child_scope = scope.without_private();
        let chain = Ancestry {
            target,
            parent: ancestry,
        };
        let single_job = self.opts.effective_jobs() == 1 && self.engine.caps().jobs.is_none();
        let serial = single_job || self.table.specials.notparallel.contains(target);
        let mut work = false;
        let mut first_error: Option<MakeError> = None;

        for mut segment in segments {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }
            segment = segment.into_iter().unique().collect();
            self.shuffle_segment(&mut segment);
            let results: Vec<Outcome> = if serial || segment.len() <= 1 {
                segment
                    .iter()
                    .map(|p| self.build_target(p, &child_scope, Some(&chain)))
                    .collect()
            } else {
                std::thread::scope(|threads| {
                    let handles: Vec<_> = segment
                        .iter()
                        .map(|p| {
                            let child_scope = &child_scope;
                            let chain = &chain;
                            threads.spawn(move || self.build_target(p, child_scope, Some(chain)))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|handle| {
                            handle.join().unwrap_or_else(|_| {
                                Err(MakeError::User {
                                    message: "prerequisite build panicked".to_owned(),
                                })
                            })
                        })
                        .collect()
                })
            };
            for result in results {
                match result {
                    Ok(w) => work |= w,
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
            if first_error.is_some() && !self.opts.keep_going {
                break;
            }
            if self.opts.mode == RunMode::Question && work {
                return Ok(true);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(work),
        }
    }

    fn shuffle_segment(&self, segment: &mut [String]) {
        match self.opts.shuffle {
            None => {}
            Some(Shuffle::Reverse) => segment.reverse(),
            Some(Shuffle::Seed(seed)) => {
                let mut state = seed | 1;
                let mut next = || {
                    state = state
                        .wrapping_mul(6_364_136_223_846_793_005)
                        .wrapping_add(1_442_695_040_888_963_407);
                    state
                };
                for i in (1..segment.len()).rev() {
                    #[allow(clippy::cast_possible_truncation)]
                    let j = (next() % (i as u64 + 1)) as usize;
                    segment.swap(i, j);
                }
            }
        }
    }

    fn run_recipe(
        &self,
        target: &str,
        rule: &Rule,
        scope: &ScopeChain,
        inputs: &AutomaticInputs,
        members: &[String],
    ) -> std::result::Result<(), MakeError> {
        let lines = rule.recipe.clone().unwrap_or_default();
        let recipe_scope = scope.with(recipe::automatics(target, inputs));
        let dry = self.opts.mode == RunMode::DryRun;
        let oneshell = self.opts.oneshell || self.table.specials.oneshell.contains(target);
        let silent_all = (self.opts.silent || self.table.specials.silent.contains(target))
            && !self.opts.no_silent;
        let ignore_all = self.opts.ignore_errors || self.table.specials.ignore.contains(target);
        let caps = self.engine.caps().clone();

        let mut expanded: Vec<(recipe::LineFlags, String, bool)> = Vec::new();
        for raw in &lines {
            let text = {
                let mut state = self.engine.lock_state();
                let mut ctx = ExpandCtx::with_scope(&mut state, &caps, recipe_scope.clone());
                ctx.expand(raw)?
            };
            let (flags, rest) = recipe::parse_flags(&text);
            if rest.trim().is_empty() {
                continue;
            }
            let forced = flags.forced || recipe::references_make(raw);
            expanded.push((flags, rest.to_owned(), forced));
        }
        if expanded.is_empty() {
            return Ok(());
        }

        let mut ran_any = false;
        if oneshell {
            let first = expanded[0].0;
            let forced = expanded.iter().any(|(_, _, f)| *f);
            for (_, text, _) in &expanded {
                if dry || (!first.silent && !silent_all) {
                    recipe::emit(&self.opts, &format!("{text}\n"), false);
                }
            }
            if !dry || forced {
                let pieces: Vec<(recipe::LineFlags, String)> = expanded
                    .iter()
                    .map(|(flags, text, _)| (*flags, text.clone()))
                    .collect();
                let script = recipe::oneshell_script(&pieces);
                let code = self.spawn(target, &script, &recipe_scope)?;
                ran_any = true;
                if code != 0 && !(first.ignore || ignore_all) {
                    return Err(self.recipe_failed(target, members, code));
                }
                if code != 0 {
                    recipe::note_ignored_failure(target, code);
                }
            }
        } else {
            for (flags, text, forced) in &expanded {
                if dry || (!flags.silent && !silent_all) {
                    recipe::emit(&self.opts, &format!("{text}\n"), false);
                }
                if dry && !*forced {
                    continue;
                }
                let code = self.spawn(target, text, &recipe_scope)?;
                ran_any = true;
                if code != 0 {
                    if flags.ignore || ignore_all {
                        recipe::note_ignored_failure(target, code);
                        continue;
                    }
                    return Err(self.recipe_failed(target, members, code));
                }
            }
        }
        if ran_any {
            // The recipe may have created files earlier decisions missed.
            self.stamps.invalidate();
        }
        Ok(())
    }

    fn spawn(
        &self,
        target: &str,
        command: &str,
        recipe_scope: &ScopeChain,
    ) -> std::result::Result<i32, MakeError> {
        let caps = self.engine.caps().clone();
        let prepared = {
            let mut state = self.engine.lock_state();
            let mut ctx = ExpandCtx::with_scope(&mut state, &caps, recipe_scope.clone());
            recipe::prepare_spawn(&mut ctx)?
        };
        recipe::spawn_command(
            caps.shell.as_ref(),
            &self.opts,
            self.jobs.as_ref(),
            target,
            command,
            &prepared,
        )
    }

    fn recipe_failed(&self, target: &str, members: &[String], code: i32) -> MakeError {
        self.delete_on_error(target, members);
        if !self.opts.keep_going {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        MakeError::Recipe {
            target: target.to_owned(),
            code,
        }
    }

    /// Remove failed targets listed in `.DELETE_ON_ERROR`, sparing the
    /// precious and secondary sets.
    fn delete_on_error(&self, target: &str, members: &[String]) {
        let specials = &self.table.specials;
        if !specials.delete_on_error.contains(target) {
            return;
        }
        let fs = self.engine.caps().fs.as_ref();
        for member in members {
            if specials.precious.contains(member) || specials.secondary.contains(member) {
                continue;
            }
            if !fs.exists(member) {
                continue;
            }
            match fs.unlink(member) {
                Ok(()) => {
                    recipe::emit(&self.opts, &format!("*** Deleting file '{member}'\n"), true);
                }
                Err(err) => {
                    warn!(
                        target: "kumade::run",
                        member, error = %err, "failed to delete target after error"
                    );
                }
            }
        }
        self.stamps.invalidate();
    }
}

fn build_table_from_state(engine: &Engine) -> Result<RuleTable> {
    let mut state = engine.lock_state();
    let caps = engine.caps().clone();
    let mut ctx = ExpandCtx::new(&mut state, &caps);
    RuleTable::build(&mut ctx)
}
