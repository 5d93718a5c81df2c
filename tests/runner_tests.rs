//! Runner invariants: memoisation, scheduling, modes, and error policy,
//! observed through the recording shell and the in-memory filesystem.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kumade::engine::{Engine, EngineConfig};
use kumade::error::MakeError;
use kumade::run::{RunMode, RunOptions};
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
fn shared_prerequisite_builds_at_most_once() {
    let (fs, shell, engine) = harness();
    engine
        .parse_str(
            "all: a b\na: shared\n\tgen-a\nb: shared\n\tgen-b\nshared:\n\tgen-shared\n",
            None,
        )
        .expect("parse");
    let fs_for_handler = fs.clone();
    shell.on_spawn(move |command| {
        for (needle, file) in [("gen-a", "a"), ("gen-b", "b"), ("gen-shared", "shared")] {
            if command.contains(needle) {
                fs_for_handler.put(file, "made");
            }
        }
        SpawnResult::default()
    });
    let options = RunOptions {
        jobs: 4,
        ..RunOptions::default()
    };
    let ran = engine.run(&goals(&["all"]), options).expect("run");
    assert!(ran);
    assert_eq!(shell.count_containing("gen-shared"), 1);
    assert_eq!(shell.count_containing("gen-a"), 1);
    assert_eq!(shell.count_containing("gen-b"), 1);
}

#[test]
fn wait_sentinel_serialises_segments() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str(
            "all: a b .WAIT c d\na:\n\tdo-a\nb:\n\tdo-b\nc:\n\tdo-c\nd:\n\tdo-d\n",
            None,
        )
        .expect("parse");
    shell.set_delay(Duration::from_millis(10));
    let options = RunOptions {
        jobs: 4,
        ..RunOptions::default()
    };
    engine.run(&goals(&["all"]), options).expect("run");

    let a = shell.call_containing("do-a").expect("a ran");
    let b = shell.call_containing("do-b").expect("b ran");
    for late in ["do-c", "do-d"] {
        let call = shell.call_containing(late).expect("late segment ran");
        assert!(
            call.started > a.finished && call.started > b.finished,
            "{late} started before the first segment settled"
        );
    }
}

#[test]
fn notparallel_target_builds_prerequisites_serially() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str(
            ".NOTPARALLEL: all\nall: x y z\nx:\n\tdo-x\ny:\n\tdo-y\nz:\n\tdo-z\n",
            None,
        )
        .expect("parse");
    shell.set_delay(Duration::from_millis(10));
    let options = RunOptions {
        jobs: 8,
        ..RunOptions::default()
    };
    engine.run(&goals(&["all"]), options).expect("run");
    assert_eq!(shell.peak_concurrency(), 1);
    assert_eq!(shell.calls().len(), 3);
}

#[test]
fn parallel_segments_do_overlap() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("all: x y z\nx:\n\tdo-x\ny:\n\tdo-y\nz:\n\tdo-z\n", None)
        .expect("parse");
    shell.set_delay(Duration::from_millis(20));
    let options = RunOptions {
        jobs: 4,
        ..RunOptions::default()
    };
    engine.run(&goals(&["all"]), options).expect("run");
    assert!(
        shell.peak_concurrency() > 1,
        "expected overlap, peak was {}",
        shell.peak_concurrency()
    );
}

#[test]
fn delete_on_error_removes_partial_output() {
    let (fs, shell, engine) = harness();
    fs.put("src", "input");
    engine
        .parse_str(".DELETE_ON_ERROR:\nout: src\n\tpartial-then-fail\n", None)
        .expect("parse");
    let fs_for_handler = fs.clone();
    shell.on_spawn(move |command| {
        if command.contains("partial-then-fail") {
            fs_for_handler.put("out", "partial");
            return SpawnResult {
                exit: 2,
                ..SpawnResult::default()
            };
        }
        SpawnResult::default()
    });
    let err = engine
        .run(&goals(&["out"]), RunOptions::default())
        .expect_err("recipe fails");
    assert!(matches!(err, MakeError::Recipe { code: 2, .. }));
    assert!(!fs.has("out"), "partial output should have been deleted");
}

#[test]
fn precious_targets_survive_failed_recipes() {
    let (fs, shell, engine) = harness();
    fs.put("src", "input");
    engine
        .parse_str(
            ".DELETE_ON_ERROR:\n.PRECIOUS: out\nout: src\n\tpartial-then-fail\n",
            None,
        )
        .expect("parse");
    let fs_for_handler = fs.clone();
    shell.on_spawn(move |command| {
        if command.contains("partial-then-fail") {
            fs_for_handler.put("out", "partial");
            return SpawnResult {
                exit: 1,
                ..SpawnResult::default()
            };
        }
        SpawnResult::default()
    });
    engine
        .run(&goals(&["out"]), RunOptions::default())
        .expect_err("recipe fails");
    assert!(fs.has("out"), "precious target must be preserved");
}

#[test]
fn automatic_variables_follow_their_contracts() {
    let (fs, shell, engine) = harness();
    fs.put_at("b", "", 100);
    fs.put_at("all", "", 150);
    fs.put_at("a", "", 200);
    fs.put_at("oo", "", 50);
    engine
        .parse_str("all: a b a | oo\n\tprobe $^ / $+ / $? / $|\n", None)
        .expect("parse");
    engine.run(&goals(&["all"]), RunOptions::default()).expect("run");
    let call = shell.call_containing("probe").expect("recipe ran");
    assert_eq!(call.command, "probe a b / a b a / a / oo");
}

#[test]
fn up_to_date_target_runs_nothing() {
    let (fs, shell, engine) = harness();
    fs.put_at("dep", "", 100);
    fs.put_at("out", "", 200);
    engine.parse_str("out: dep\n\tregen\n", None).expect("parse");
    let ran = engine
        .run(&goals(&["out"]), RunOptions::default())
        .expect("run");
    assert!(!ran);
    assert!(shell.calls().is_empty());
}

#[test]
fn stale_target_rebuilds_and_always_forces() {
    let (fs, shell, engine) = harness();
    fs.put_at("out", "", 100);
    fs.put_at("dep", "", 200);
    engine.parse_str("out: dep\n\tregen\n", None).expect("parse");
    let fs_for_handler = fs.clone();
    shell.on_spawn(move |command| {
        if command.contains("regen") {
            fs_for_handler.put("out", "fresh");
        }
        SpawnResult::default()
    });
    assert!(engine.run(&goals(&["out"]), RunOptions::default()).expect("run"));
    assert_eq!(shell.count_containing("regen"), 1);

    // Now up to date, but `always` still rebuilds.
    let options = RunOptions {
        always: true,
        ..RunOptions::default()
    };
    assert!(engine.run(&goals(&["out"]), options).expect("run"));
    assert_eq!(shell.count_containing("regen"), 2);
}

#[test]
fn phony_targets_rebuild_every_run() {
    let (fs, shell, engine) = harness();
    fs.put("clean", "a file named like the phony target");
    engine
        .parse_str(".PHONY: clean\nclean:\n\tdo-clean\n", None)
        .expect("parse");
    engine.run(&goals(&["clean"]), RunOptions::default()).expect("run");
    engine.run(&goals(&["clean"]), RunOptions::default()).expect("run");
    assert_eq!(shell.count_containing("do-clean"), 2);
}

#[test]
fn dry_run_prints_without_spawning_except_forced_lines() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("all:\n\tnormal-line\n\t+forced-line\n", None)
        .expect("parse");
    let printed = Arc::new(Mutex::new(String::new()));
    let sink = printed.clone();
    let options = RunOptions {
        mode: RunMode::DryRun,
        output: Some(Arc::new(move |chunk: &str| {
            sink.lock().expect("sink lock").push_str(chunk);
        })),
        ..RunOptions::default()
    };
    let ran = engine.run(&goals(&["all"]), options).expect("run");
    assert!(ran, "dry-run reports that work would happen");
    let printed = printed.lock().expect("sink lock");
    assert!(printed.contains("normal-line"));
    assert!(printed.contains("forced-line"));
    assert_eq!(shell.calls().len(), 1, "only the + line may spawn");
    assert_eq!(shell.count_containing("forced-line"), 1);
}

#[test]
fn question_mode_reports_without_executing() {
    let (fs, shell, engine) = harness();
    fs.put_at("out", "", 100);
    fs.put_at("src", "", 200);
    engine.parse_str("out: src\n\tregen\n", None).expect("parse");
    let options = RunOptions {
        mode: RunMode::Question,
        ..RunOptions::default()
    };
    assert!(engine.run(&goals(&["out"]), options.clone()).expect("run"));
    assert!(shell.calls().is_empty());

    fs.put_at("out", "", 300);
    assert!(!engine.run(&goals(&["out"]), options).expect("run"));
    assert!(shell.calls().is_empty());
}

#[test]
fn touch_mode_freshens_targets_without_recipes() {
    let (fs, shell, engine) = harness();
    fs.put_at("out", "stale", 100);
    fs.put_at("src", "", 200);
    engine.parse_str("out: src\n\tregen\n", None).expect("parse");
    let options = RunOptions {
        mode: RunMode::Touch,
        ..RunOptions::default()
    };
    assert!(engine.run(&goals(&["out"]), options).expect("run"));
    assert!(shell.calls().is_empty());
    assert_eq!(fs.contents("out").as_deref(), Some("stale"));

    // The touch brought it up to date for a normal run.
    assert!(!engine.run(&goals(&["out"]), RunOptions::default()).expect("run"));
}

#[test]
fn keep_going_finishes_other_goals_and_reports() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("bad:\n\tfail-now\ngood:\n\tdo-good\n", None)
        .expect("parse");
    shell.on_spawn(|command| {
        if command.contains("fail-now") {
            SpawnResult {
                exit: 1,
                ..SpawnResult::default()
            }
        } else {
            SpawnResult::default()
        }
    });
    let options = RunOptions {
        keep_going: true,
        ..RunOptions::default()
    };
    let err = engine
        .run(&goals(&["bad", "good"]), options)
        .expect_err("overall failure");
    match err {
        MakeError::KeepGoing { failed } => assert_eq!(failed, vec!["bad"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(shell.count_containing("do-good"), 1, "good goal still built");
}

#[test]
fn ignored_failures_do_not_stop_the_recipe() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("all:\n\t-may-fail\n\tafter\n", None)
        .expect("parse");
    shell.on_spawn(|command| {
        if command.contains("may-fail") {
            SpawnResult {
                exit: 9,
                ..SpawnResult::default()
            }
        } else {
            SpawnResult::default()
        }
    });
    engine.run(&goals(&["all"]), RunOptions::default()).expect("run");
    assert_eq!(shell.count_containing("after"), 1);
}

#[test]
fn missing_rule_is_a_structured_error() {
    let (_fs, _shell, engine) = harness();
    engine.parse_str("app: libmissing.quux\n\tlink\n", None).expect("parse");
    let err = engine
        .run(&goals(&["app"]), RunOptions::default())
        .expect_err("no rule");
    match err {
        MakeError::NoRule { target, needed_by } => {
            assert_eq!(target, "libmissing.quux");
            assert_eq!(needed_by.as_deref(), Some("app"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn oneshell_joins_the_recipe_into_one_invocation() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str(".ONESHELL:\nall:\n\tstep-one\n\tstep-two\n", None)
        .expect("parse");
    engine.run(&goals(&["all"]), RunOptions::default()).expect("run");
    assert_eq!(shell.calls().len(), 1);
    assert_eq!(shell.commands()[0], "(step-one) && (step-two)");
}

#[test]
fn exported_variables_reach_the_recipe_environment() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("export GREETING = hello\nHIDDEN = no\nall:\n\tshow-env\n", None)
        .expect("parse");
    engine.run(&goals(&["all"]), RunOptions::default()).expect("run");
    let call = shell.call_containing("show-env").expect("ran");
    let env: std::collections::HashMap<_, _> = call.env.into_iter().collect();
    assert_eq!(env.get("GREETING").map(String::as_str), Some("hello"));
    assert!(!env.contains_key("HIDDEN"));
    assert_eq!(env.get("MAKELEVEL").map(String::as_str), Some("1"));
}

#[test]
fn vpath_resolution_feeds_automatic_variables() {
    let (fs, shell, engine) = harness();
    fs.put("src/foo.c", "int main;");
    engine
        .parse_str("vpath %.c src\nfoo.o: foo.c\n\tcc -c $<\n", None)
        .expect("parse");
    engine.run(&goals(&["foo.o"]), RunOptions::default()).expect("run");
    let call = shell.call_containing("cc -c").expect("compile ran");
    assert_eq!(call.command, "cc -c src/foo.c");
}

#[test]
fn circular_dependencies_are_dropped_not_deadlocked() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("a: b\n\tmake-a\nb: a\n\tmake-b\n", None)
        .expect("parse");
    engine.run(&goals(&["a"]), RunOptions::default()).expect("run");
    assert_eq!(shell.count_containing("make-a"), 1);
    assert_eq!(shell.count_containing("make-b"), 1);
}

#[test]
fn shuffle_reverse_still_builds_everything() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("all: p q r\np:\n\tdo-p\nq:\n\tdo-q\nr:\n\tdo-r\n", None)
        .expect("parse");
    let options = RunOptions {
        shuffle: Some(kumade::run::Shuffle::Reverse),
        ..RunOptions::default()
    };
    engine.run(&goals(&["all"]), options).expect("run");
    assert_eq!(shell.calls().len(), 3);
    // Serial reverse order is observable with the default single job.
    assert_eq!(shell.commands(), vec!["do-r", "do-q", "do-p"]);
}

#[test]
fn default_goal_used_when_no_goals_given() {
    let (_fs, shell, engine) = harness();
    engine
        .parse_str("first:\n\tdo-first\nsecond:\n\tdo-second\n", None)
        .expect("parse");
    engine.run(&[], RunOptions::default()).expect("run");
    assert_eq!(shell.count_containing("do-first"), 1);
    assert_eq!(shell.count_containing("do-second"), 0);
}
