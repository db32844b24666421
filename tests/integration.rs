//! End-to-end tests driving the neval binary.
//!
//! Each test writes a job-set expression into a temp directory, runs the
//! real binary against it, and checks the stdout stream line by line.

use std::collections::BTreeMap;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value as Json, json};
use tempfile::tempdir;

fn neval() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("neval").unwrap()
}

fn write_expr(dir: &Path, name: &str, expr: &Json) -> String {
    let path = dir.join(name);
    std::fs::write(&path, expr.to_string()).unwrap();
    path.to_string_lossy().into_owned()
}

fn drv(name: &str) -> Json {
    json!({
        "type": "derivation",
        "name": name,
        "system": "x86_64-linux",
        "drvPath": format!("/nix/store/{name}.drv"),
        "outputs": {"out": format!("/nix/store/{name}")},
        "meta": {"description": format!("the {name} package")},
    })
}

/// Run the command, assert success, and parse every stdout line as JSON.
fn run_lines(cmd: &mut Command) -> Vec<Json> {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "exit: {:?}, stderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout line is not JSON"))
        .collect()
}

#[test]
fn single_leaf_at_the_root() {
    let dir = tempdir().unwrap();
    let expr = write_expr(dir.path(), "jobs.json", &drv("hello"));

    let lines = run_lines(neval().arg(&expr));
    assert_eq!(lines.len(), 1);

    let leaf = &lines[0];
    assert_eq!(leaf["name"], "hello");
    assert_eq!(leaf["system"], "x86_64-linux");
    assert_eq!(leaf["drvPath"], "/nix/store/hello.drv");
    assert_eq!(leaf["outputs"]["out"], "/nix/store/hello");
    assert_eq!(leaf["path"], json!([]));
    assert!(leaf.get("meta").is_none());
}

#[test]
fn flat_attribute_set() {
    let dir = tempdir().unwrap();
    let expr = write_expr(dir.path(), "jobs.json", &json!({"a": drv("a"), "b": drv("b")}));

    let lines = run_lines(neval().arg(&expr));
    assert_eq!(lines.len(), 2);

    let mut names: Vec<_> = lines.iter().map(|l| l["name"].as_str().unwrap()).collect();
    names.sort();
    assert_eq!(names, ["a", "b"]);
}

#[test]
fn nested_sets_expand_path_by_path() {
    let dir = tempdir().unwrap();
    let expr = write_expr(dir.path(), "jobs.json", &json!({"g": {"h": drv("deep")}}));

    let lines = run_lines(neval().arg(&expr));
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["name"], "deep");
    assert_eq!(lines[0]["path"], json!(["g", "h"]));
    assert_eq!(lines[0]["attr"], "\"g\".\"h\"");
}

#[test]
fn lists_expand_by_index() {
    let dir = tempdir().unwrap();
    let expr = write_expr(dir.path(), "jobs.json", &json!([drv("zero"), drv("one")]));

    let lines = run_lines(neval().arg(&expr));
    assert_eq!(lines.len(), 2);

    let mut paths: Vec<_> = lines.iter().map(|l| l["path"].to_string()).collect();
    paths.sort();
    assert_eq!(paths, ["[0]", "[1]"]);
}

#[test]
fn null_values_are_pruned() {
    let dir = tempdir().unwrap();
    let expr = write_expr(dir.path(), "jobs.json", &json!({"a": null, "b": drv("kept")}));

    let lines = run_lines(neval().arg(&expr));
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["name"], "kept");
    assert_eq!(lines[0]["path"], json!(["b"]));
}

#[test]
fn per_path_errors_do_not_abort_the_run() {
    let dir = tempdir().unwrap();
    let expr = write_expr(
        dir.path(),
        "jobs.json",
        &json!({"bad": {"__throw": "boom"}, "good": drv("good")}),
    );

    let lines = run_lines(neval().args(["--workers", "1"]).arg(&expr));
    assert_eq!(lines.len(), 2);

    let error = lines.iter().find(|l| l.get("error").is_some()).unwrap();
    assert_eq!(error["error"], "boom");
    assert_eq!(error["path"], json!(["bad"]));

    let leaf = lines.iter().find(|l| l.get("name").is_some()).unwrap();
    assert_eq!(leaf["name"], "good");
}

#[test]
fn memory_ceiling_recycles_workers() {
    let dir = tempdir().unwrap();
    let expr = write_expr(
        dir.path(),
        "jobs.json",
        &json!({
            "a": drv("a"),
            "b": {"c": drv("c"), "d": drv("d")},
            "e": drv("e"),
        }),
    );

    // 1 MiB is far below any steady-state RSS, so every job costs a worker.
    let lines = run_lines(
        neval()
            .args(["--workers", "2", "--max-memory-size", "1"])
            .arg(&expr),
    );

    let mut names: Vec<_> = lines.iter().map(|l| l["name"].as_str().unwrap()).collect();
    names.sort();
    assert_eq!(names, ["a", "c", "d", "e"]);
}

#[test]
fn unknown_system_is_a_per_path_error() {
    let dir = tempdir().unwrap();
    let mut bad = drv("bad");
    bad["system"] = json!("unknown");
    let expr = write_expr(dir.path(), "jobs.json", &json!({"bad": bad, "ok": drv("ok")}));

    let lines = run_lines(neval().arg(&expr));
    assert_eq!(lines.len(), 2);

    let error = lines.iter().find(|l| l.get("error").is_some()).unwrap();
    assert_eq!(error["path"], json!(["bad"]));
    assert!(error["error"].as_str().unwrap().contains("'system'"));
    assert!(lines.iter().any(|l| l["name"] == "ok"));
}

#[test]
fn meta_is_included_only_on_request() {
    let dir = tempdir().unwrap();
    let expr = write_expr(dir.path(), "jobs.json", &json!({"a": drv("a")}));

    let without = run_lines(neval().arg(&expr));
    assert!(without[0].get("meta").is_none());

    let with = run_lines(neval().arg("--meta").arg(&expr));
    assert_eq!(with[0]["meta"]["description"], "the a package");
}

#[test]
fn recurse_marker_expands_to_multiple_leaves() {
    let dir = tempdir().unwrap();
    let expr = write_expr(
        dir.path(),
        "jobs.json",
        &json!({
            "bundle": {
                "recurseForDerivations": true,
                "one": drv("one"),
                "two": drv("two"),
            }
        }),
    );

    let lines = run_lines(neval().arg(&expr));
    assert_eq!(lines.len(), 2);
    // Both leaves were reached through the same path.
    for line in &lines {
        assert_eq!(line["path"], json!(["bundle"]));
    }
}

#[test]
fn flake_references_select_a_fragment() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("flake.json"),
        json!({
            "hydraJobs": {"default": drv("from-hydra-jobs")},
            "release": {"default": drv("from-release")},
        })
        .to_string(),
    )
    .unwrap();

    let base = dir.path().to_string_lossy().into_owned();
    let lines = run_lines(neval().arg("--flake").arg(&base));
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["name"], "from-hydra-jobs");

    let lines = run_lines(neval().arg("--flake").arg(format!("{base}#release")));
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["name"], "from-release");
}

#[test]
fn flakes_evaluate_purely_unless_impure() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("flake.json"),
        json!({"hydraJobs": {"a": {"__env": "HOME"}}}).to_string(),
    )
    .unwrap();
    let base = dir.path().to_string_lossy().into_owned();

    let lines = run_lines(neval().arg("--flake").arg(&base));
    assert_eq!(lines.len(), 1);
    let error = lines[0]["error"].as_str().unwrap();
    assert!(error.contains("pure evaluation mode"), "{error}");
}

#[test]
fn plain_files_evaluate_impurely() {
    let dir = tempdir().unwrap();
    let mut named = drv("placeholder");
    named["name"] = json!({"__env": "NEVAL_TEST_NAME"});
    let expr = write_expr(dir.path(), "jobs.json", &json!({"a": named}));

    let lines = run_lines(neval().env("NEVAL_TEST_NAME", "from-env").arg(&expr));
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["name"], "from-env");
}

#[test]
fn gc_roots_are_registered_per_leaf() {
    let dir = tempdir().unwrap();
    let roots = dir.path().join("roots");
    let expr = write_expr(dir.path(), "jobs.json", &json!({"a": drv("a"), "b": drv("b")}));

    run_lines(
        neval()
            .arg("--gc-roots-dir")
            .arg(&roots)
            .arg(&expr),
    );

    for name in ["a.drv", "b.drv"] {
        let root = roots.join(name);
        assert!(
            root.symlink_metadata().unwrap().file_type().is_symlink(),
            "missing root {name}"
        );
    }
}

#[test]
fn show_trace_appends_evaluation_frames() {
    let dir = tempdir().unwrap();
    let expr_json = json!({
        "bundle": {
            "recurseForDerivations": true,
            "broken": {"__throw": "boom"},
        }
    });
    let expr = write_expr(dir.path(), "jobs.json", &expr_json);

    let terse = run_lines(neval().arg(&expr));
    assert_eq!(terse[0]["error"], "boom");

    let traced = run_lines(neval().arg("--show-trace").arg(&expr));
    let error = traced[0]["error"].as_str().unwrap();
    assert!(error.contains("boom"));
    assert!(error.contains("while evaluating the attribute 'broken'"), "{error}");
}

#[test]
fn wide_trees_survive_parallel_workers() {
    let dir = tempdir().unwrap();
    let mut attrs = serde_json::Map::new();
    for i in 0..24 {
        attrs.insert(format!("job{i:02}"), json!({"inner": drv(&format!("pkg{i:02}"))}));
    }
    let expr = write_expr(dir.path(), "jobs.json", &Json::Object(attrs));

    let lines = run_lines(neval().args(["--workers", "4"]).arg(&expr));
    assert_eq!(lines.len(), 24);

    // Exactly one result per leaf, no duplicates, well-formed lines only.
    let mut seen = BTreeMap::new();
    for line in &lines {
        let name = line["name"].as_str().unwrap().to_string();
        *seen.entry(name).or_insert(0) += 1;
    }
    assert!(seen.values().all(|&n| n == 1));
    assert_eq!(seen.len(), 24);
}

#[test]
fn missing_expression_file_is_fatal() {
    neval()
        .arg("/does/not/exist.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn top_level_type_errors_are_fatal() {
    let dir = tempdir().unwrap();
    let expr = write_expr(dir.path(), "jobs.json", &json!("just a string"));

    neval()
        .arg(&expr)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not supported"));
}

#[test]
fn usage_errors_exit_nonzero() {
    neval().assert().failure();
}

#[test]
fn help_prints_the_flag_surface() {
    neval()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--max-memory-size"))
        .stdout(predicate::str::contains("--gc-roots-dir"));
}
