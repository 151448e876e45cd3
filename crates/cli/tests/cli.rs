use clap::Parser;
use kiln::{Cli, Commands};
use kiln_cache::{CacheConfig, CacheStore};
use kiln_core::{OptimizationLevel, Priority, TaskStatus};
use kiln_task::history::read_records;
use std::process::ExitCode;

mod common;
use common::Sandbox;

async fn run(sandbox: &Sandbox, rest: &[&str]) -> ExitCode {
    Cli::try_parse_from(sandbox.argv(rest))
        .unwrap()
        .run()
        .await
        .unwrap()
}

#[test]
fn compile_flags_build_the_request() {
    let cli = Cli::try_parse_from([
        "kiln", "compile", "-C", "/src/app", "-p", "critical", "-O", "O2", "-g", "-W", "-s",
        "main.c", "-o", "main.o", "-e", "LANG=C", "cc", "--", "-c", "main.c",
    ])
    .unwrap();
    let Commands::Compile(args) = cli.command else {
        panic!("expected compile");
    };

    let request = args.to_request();
    assert_eq!(request.project_path.to_str(), Some("/src/app"));
    assert_eq!(request.priority, Priority::Critical);
    assert_eq!(request.compiler.command, "cc");
    assert_eq!(request.compiler.args, vec!["-c", "main.c"]);
    assert_eq!(request.compiler.optimization, OptimizationLevel::O2);
    assert!(request.compiler.debug && request.compiler.warnings);
    assert_eq!(request.sources.len(), 1);
    assert_eq!(request.compiler.outputs.len(), 1);
    assert_eq!(request.env.get("LANG").map(String::as_str), Some("C"));
}

#[test]
fn unknown_priority_is_a_usage_error() {
    assert!(Cli::try_parse_from(["kiln", "compile", "-p", "urgent", "cc"]).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_identical_compile_comes_from_the_cache() {
    let sandbox = Sandbox::new();
    let project = sandbox.project().display().to_string();
    let compile = ["compile", "-C", project.as_str(), "sh", "--", "-c", "echo built"];

    assert_eq!(run(&sandbox, &compile).await, ExitCode::SUCCESS);
    assert_eq!(run(&sandbox, &compile).await, ExitCode::SUCCESS);

    let records = read_records(&sandbox.history()).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == TaskStatus::Succeeded));
    assert!(!records[0].from_cache);
    assert!(records[1].from_cache);

    let store = CacheStore::open(CacheConfig::with_base_dir(sandbox.cache_dir())).unwrap();
    assert_eq!(store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_compile_sets_the_exit_code_and_is_not_cached() {
    let sandbox = Sandbox::new();
    let project = sandbox.project().display().to_string();
    let compile = ["compile", "-C", project.as_str(), "sh", "--", "-c", "exit 3"];

    assert_eq!(run(&sandbox, &compile).await, ExitCode::FAILURE);

    let records = read_records(&sandbox.history()).unwrap();
    assert_eq!(records[0].status, TaskStatus::Failed);
    assert_eq!(records[0].exit_code, Some(3));
    let store = CacheStore::open(CacheConfig::with_base_dir(sandbox.cache_dir())).unwrap();
    assert!(store.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_runs_every_request_then_cache_clear_empties_it() {
    let sandbox = Sandbox::new();
    let manifest = sandbox.path().join("batch.json");
    std::fs::write(
        &manifest,
        r#"{"requests": [
            {"project_path": "project", "compiler": {"command": "sh", "args": ["-c", "echo one"]}},
            {"project_path": "project", "compiler": {"command": "sh", "args": ["-c", "echo two"]}, "priority": "high"}
        ]}"#,
    )
    .unwrap();
    let manifest = manifest.display().to_string();

    assert_eq!(
        run(&sandbox, &["batch", manifest.as_str()]).await,
        ExitCode::SUCCESS
    );
    assert_eq!(read_records(&sandbox.history()).unwrap().len(), 2);

    assert_eq!(run(&sandbox, &["cache", "clear"]).await, ExitCode::SUCCESS);
    let store = CacheStore::open(CacheConfig::with_base_dir(sandbox.cache_dir())).unwrap();
    assert!(store.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_cache_never_writes_entries() {
    let sandbox = Sandbox::new();
    let project = sandbox.project().display().to_string();
    let compile = [
        "--no-cache",
        "compile",
        "-C",
        project.as_str(),
        "sh",
        "--",
        "-c",
        "true",
    ];

    assert_eq!(run(&sandbox, &compile).await, ExitCode::SUCCESS);
    assert_eq!(run(&sandbox, &compile).await, ExitCode::SUCCESS);

    let records = read_records(&sandbox.history()).unwrap();
    assert!(records.iter().all(|r| !r.from_cache));
    assert!(!sandbox.cache_dir().join("entries").exists() || {
        let store = CacheStore::open(CacheConfig::with_base_dir(sandbox.cache_dir())).unwrap();
        store.is_empty()
    });
}

#[tokio::test]
async fn empty_batch_manifest_is_rejected() {
    let sandbox = Sandbox::new();
    let manifest = sandbox.path().join("empty.json");
    std::fs::write(&manifest, "[]").unwrap();
    let manifest = manifest.display().to_string();

    let cli = Cli::try_parse_from(sandbox.argv(&["batch", manifest.as_str()])).unwrap();
    let error = cli.run().await.unwrap_err();
    assert!(error.to_string().contains("no compile requests"));
}
