//! End-to-end build scenarios: grouped rules, double-colon appends,
//! target-specific scopes, implicit chains, second expansion, and the
//! deferred-include round trip.

use std::sync::Arc;

use kumade::engine::{Engine, EngineConfig};
use kumade::run::RunOptions;
use test_support::{MemoryFs, RecordingShell, SpawnResult, capabilities};

fn harness() -> (Arc<MemoryFs>, Arc<RecordingShell>, Engine) {
    let fs = Arc::new(MemoryFs::new());
    let shell = Arc::new(RecordingShell::new());
    let caps = capabilities(&fs, &shell);
    let config = EngineConfig {
        curdir: Some("/work".into()),
        ..EngineConfig::default()
    };
    (fs.clone(), shell.clone(), Engine::with_config(caps, &config))
}

fn goals(names: &[&str]) -> Vec<String> {
    names.iter().map(|&n| n.to_owned()).collect()
}

#[test]
fn grouped_rule_builds_both_targets_with_one_recipe() {
    let (fs, shell, engine) = harness();
    fs.put("src/seed", "seed");
    engine
        .parse_str(
            "all: build/g1 build/g2\nbuild/g1 build/g2 &: src/seed\n\twrite-both\n",
            None,
        )
        .expect("parse");
    let fs_for_handler = fs.clone();
    shell.on_spawn(move |command| {
        if command.contains("write-both") {
            fs_for_handler.put("build/g1", "one");
            fs_for_handler.put("build/g2", "two");
        }
        SpawnResult::default()
    });
    let options = RunOptions {
        jobs: 4,
        ..RunOptions::default()
    };
    let ran = engine.run(&goals(&["all"]), options.clone()).expect("run");
    assert!(ran);
    assert_eq!(shell.count_containing("write-both"), 1);
    assert!(fs.has("build/g1") && fs.has("build/g2"));

    // A second run is a no-op.
    let ran = engine.run(&goals(&["all"]), options).expect("run");
    assert!(!ran);
    assert_eq!(shell.count_containing("write-both"), 1);
}

#[test]
fn double_colon_rules_run_independently_in_order() {
    let (fs, shell, engine) = harness();
    fs.put("s1", "");
    fs.put("s2", "");
    engine
        .parse_str("log:: s1\n\tappend-one\nlog:: s2\n\tappend-two\n", None)
        .expect("parse");
    let fs_for_handler = fs.clone();
    shell.on_spawn(move |command| {
        let line = if command.contains("append-one") {
            "one\n"
        } else if command.contains("append-two") {
            "two\n"
        } else {
            return SpawnResult::default();
        };
        let existing = fs_for_handler.contents("log").unwrap_or_default();
        fs_for_handler.put("log", &format!("{existing}{line}"));
        SpawnResult::default()
    });
    engine.run(&goals(&["log"]), RunOptions::default()).expect("run");
    assert_eq!(shell.count_containing("append-one"), 1);
    assert_eq!(shell.count_containing("append-two"), 1);
    assert_eq!(fs.contents("log").as_deref(), Some("one\ntwo\n"));

    let one = shell.call_containing("append-one").expect("one");
    let two = shell.call_containing("append-two").expect("two");
    assert!(one.finished < two.started, "declaration order preserved");
}

#[test]
fn private_target_variable_does_not_reach_prerequisites() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str(
            "MSG = outer\nout/done: private MSG = local\nout/done: out/dep\nout/dep: ; echo $(MSG)\n",
            None,
        )
        .expect("parse");
    engine
        .run(&goals(&["out/done"]), RunOptions::default())
        .expect("run");
    let call = shell.call_containing("echo").expect("dep recipe ran");
    assert_eq!(call.command, "echo outer");
}

#[test]
fn target_scope_itself_sees_the_private_variable() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("MSG = outer\nout: private MSG = local\nout: ; echo $(MSG)\n", None)
        .expect("parse");
    engine.run(&goals(&["out"]), RunOptions::default()).expect("run");
    let call = shell.call_containing("echo").expect("recipe ran");
    assert_eq!(call.command, "echo local");
}

#[test]
fn implicit_chain_builds_intermediate_then_target() {
    let (fs, shell, engine) = harness();
    fs.put("foo.y", "grammar");
    engine
        .parse_str("%.o: %.c\n\tcompile $<\n%.c: %.y\n\tyacc $<\n", None)
        .expect("parse");
    let fs_for_handler = fs.clone();
    shell.on_spawn(move |command| {
        if command.contains("yacc") {
            fs_for_handler.put("foo.c", "c source");
        }
        if command.contains("compile") {
            fs_for_handler.put("foo.o", "object");
        }
        SpawnResult::default()
    });
    engine.run(&goals(&["foo.o"]), RunOptions::default()).expect("run");
    assert_eq!(shell.commands(), vec!["yacc foo.y", "compile foo.c"]);
    assert!(fs.has("foo.o"));
}

#[test]
fn second_expansion_binds_stem_in_the_second_pass() {
    let (fs, shell, engine) = harness();
    fs.put("seed1", "");
    fs.put("seed2", "");
    engine
        .parse_str(
            ".SECONDEXPANSION:\nDEPS_foo = seed1 seed2\n%.out: $$(DEPS_$$*)\n\tcombine $^\n",
            None,
        )
        .expect("parse");
    engine
        .run(&goals(&["foo.out"]), RunOptions::default())
        .expect("run");
    let call = shell.call_containing("combine").expect("recipe ran");
    assert_eq!(call.command, "combine seed1 seed2");
}

#[test]
fn deferred_include_is_built_then_reloaded() {
    let (fs, shell, engine) = harness();
    engine
        .parse_str(
            "-include gen.mk\nall:\n\tuse $(FROM_GEN)\ngen.mk:\n\tmake-gen\n",
            None,
        )
        .expect("parse");
    let fs_for_handler = fs.clone();
    shell.on_spawn(move |command| {
        if command.contains("make-gen") {
            fs_for_handler.put("gen.mk", "FROM_GEN = generated-value\n");
        }
        SpawnResult::default()
    });
    engine.run(&goals(&["all"]), RunOptions::default()).expect("run");
    assert_eq!(shell.count_containing("make-gen"), 1);
    let call = shell.call_containing("use ").expect("all recipe ran");
    assert_eq!(call.command, "use generated-value");
}

#[test]
fn mandatory_include_failure_is_fatal_at_parse_time() {
    let (_fs, _shell, engine) = harness();
    let err = engine
        .parse_str("include missing.mk\n", None)
        .expect_err("include fails");
    assert!(err.to_string().contains("missing.mk"));
}

#[test]
fn shell_assignment_runs_at_parse_time_and_sets_shellexit() {
    let (_fs, shell, engine) = harness();
    shell.on_spawn(|command| {
        if command.contains("git describe") {
            SpawnResult {
                exit: 0,
                stdout: "v1.2\n".to_owned(),
                stderr: String::new(),
            }
        } else {
            SpawnResult::default()
        }
    });
    engine.parse_str("VERSION != git describe\n", None).expect("parse");
    assert_eq!(engine.variable("VERSION").as_deref(), Some("v1.2"));
    assert_eq!(engine.variable(".SHELLEXIT").as_deref(), Some("0"));
    assert_eq!(shell.count_containing("git describe"), 1);
}

#[test]
fn shell_function_collapses_newlines() {
    let (_fs, shell, engine) = harness();
    shell.on_spawn(|command| {
        if command.contains("ls") {
            SpawnResult {
                exit: 3,
                stdout: "a\nb\nc\n".to_owned(),
                stderr: String::new(),
            }
        } else {
            SpawnResult::default()
        }
    });
    engine.parse_str("FILES := $(shell ls)\n", None).expect("parse");
    assert_eq!(engine.variable("FILES").as_deref(), Some("a b c"));
    assert_eq!(engine.variable(".SHELLEXIT").as_deref(), Some("3"));
}

#[test]
fn file_function_writes_appends_and_reads() {
    let (fs, _shell, engine) = harness();
    engine
        .parse_str(
            "$(file > notes.txt,first)\n$(file >> notes.txt,second)\nBACK := $(file < notes.txt)\n",
            None,
        )
        .expect("parse");
    assert_eq!(fs.contents("notes.txt").as_deref(), Some("first\nsecond\n"));
    assert_eq!(engine.variable("BACK").as_deref(), Some("first\nsecond"));
}

#[test]
fn wildcard_function_uses_the_injected_filesystem() {
    let (fs, _shell, engine) = harness();
    fs.put("a.c", "");
    fs.put("b.c", "");
    fs.put("c.h", "");
    engine.parse_str("SRCS := $(wildcard *.c)\n", None).expect("parse");
    assert_eq!(engine.variable("SRCS").as_deref(), Some("a.c b.c"));
}

#[test]
fn makecmdgoals_reflects_the_requested_goals() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("one two:\n\tbuilt $@ of $(MAKECMDGOALS)\n", None)
        .expect("parse");
    engine
        .run(&goals(&["one", "two"]), RunOptions::default())
        .expect("run");
    let call = shell.call_containing("built one").expect("one ran");
    assert_eq!(call.command, "built one of one two");
    assert!(shell.call_containing("built two").is_some());
}

#[test]
fn extra_prereqs_participate_in_staleness_but_not_automatics() {
    let (fs, shell, engine) = harness();
    fs.put_at("out", "", 500);
    fs.put_at("dep", "", 400);
    fs.put_at("tracker", "", 600);
    engine
        .parse_str("out: .EXTRA_PREREQS = tracker\nout: dep\n\tregen $^\n", None)
        .expect("parse");
    engine.run(&goals(&["out"]), RunOptions::default()).expect("run");
    // tracker (600) is newer than out (500), so the recipe runs, but the
    // extra prerequisite stays out of $^.
    let call = shell.call_containing("regen").expect("recipe ran");
    assert_eq!(call.command, "regen dep");
}

#[test]
fn target_and_pattern_scopes_merge_with_exact_winning() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str(
            "%.o: FLAGS = -O1\n%.o: KIND = pattern\nspecial.o: FLAGS = -O3\n%.o:\n\tcc $(FLAGS) $(KIND)\n",
            None,
        )
        .expect("parse");
    engine
        .run(&goals(&["special.o"]), RunOptions::default())
        .expect("run");
    let call = shell.call_containing("cc").expect("recipe ran");
    assert_eq!(call.command, "cc -O3 pattern");
}
