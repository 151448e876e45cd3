use kiln_cache::{CacheConfig, CacheStore};
use kiln_core::{
    CompileRequest, CompilerConfig, Error, MemoryHistory, Priority, SchedulerEvent, TaskId,
    TaskStatus,
};
use kiln_task::testing::{MockBridge, MockStep};
use kiln_task::{Scheduler, SchedulerConfig, SchedulerState, SHUTDOWN_REASON};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    scheduler: Scheduler,
    bridge: Arc<MockBridge>,
    history: Arc<MemoryHistory>,
    _cache_dir: Option<TempDir>,
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default().tick_interval(Duration::from_millis(10))
}

fn harness(config: SchedulerConfig, bridge: MockBridge, with_cache: bool) -> Harness {
    let bridge = Arc::new(bridge);
    let history = Arc::new(MemoryHistory::new());
    let (cache, cache_dir) = if with_cache {
        let dir = TempDir::new().unwrap();
        let cache = CacheStore::open(CacheConfig::with_base_dir(dir.path())).unwrap();
        (Some(cache), Some(dir))
    } else {
        (None, None)
    };
    let scheduler = Scheduler::new(config, bridge.clone(), cache, history.clone()).unwrap();
    Harness {
        scheduler,
        bridge,
        history,
        _cache_dir: cache_dir,
    }
}

/// A request whose cache key differs for every distinct `n`
fn request(command: &str, n: usize) -> CompileRequest {
    CompileRequest::new(
        std::env::temp_dir(),
        CompilerConfig::new(command).with_args([format!("unit-{n}.c")]),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrency_never_exceeds_the_limit() {
    let h = harness(
        fast_config().max_concurrent(3),
        MockBridge::new(MockStep::succeed("ok").with_delay(Duration::from_millis(300))),
        false,
    );
    let ids: Vec<TaskId> = (0..5)
        .map(|n| h.scheduler.add_task(request("cc", n)).unwrap())
        .collect();
    h.scheduler.start().unwrap();

    wait_until(|| h.scheduler.running_count() == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.scheduler.running_count(), 3);
    assert_eq!(h.scheduler.get_task_state(ids[3]), Some(TaskStatus::Queued));
    assert_eq!(h.scheduler.get_task_state(ids[4]), Some(TaskStatus::Queued));
    assert_eq!(h.scheduler.queued_count(), 2);

    let finished = h.scheduler.wait_all(WAIT).await.unwrap();
    assert!(finished.iter().all(|t| t.status == TaskStatus::Succeeded));
    assert!(h.bridge.peak_active() <= 3);
    assert_eq!(h.bridge.call_count(), 5);
    for id in ids {
        assert_eq!(h.history.count_for(id), 1);
    }
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn critical_task_jumps_the_queue() {
    let h = harness(
        fast_config().max_concurrent(3),
        MockBridge::new(MockStep::succeed("ok").with_delay(Duration::from_millis(200))),
        false,
    );
    h.scheduler.start().unwrap();
    for n in 0..3 {
        h.scheduler.add_task(request("cc", n)).unwrap();
    }
    wait_until(|| h.scheduler.running_count() == 3).await;

    let normal_a = h.scheduler.add_task(request("cc", 10)).unwrap();
    let normal_b = h.scheduler.add_task(request("cc", 11)).unwrap();
    let critical = h
        .scheduler
        .add_task(request("cc", 12).with_priority(Priority::Critical))
        .unwrap();
    assert_eq!(h.scheduler.get_task_state(critical), Some(TaskStatus::Queued));

    h.scheduler.wait_all(WAIT).await.unwrap();
    assert_eq!(h.bridge.call_count(), 6);
    let started = |id| h.scheduler.get_task(id).unwrap().started_at.unwrap();
    assert!(started(critical) <= started(normal_a));
    assert!(started(normal_a) <= started(normal_b));
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overdue_task_is_cancelled() {
    let h = harness(
        fast_config().task_timeout(Duration::from_millis(100)),
        MockBridge::new(MockStep::hang()),
        false,
    );
    h.scheduler.start().unwrap();
    let id = h.scheduler.add_task(request("cc", 0)).unwrap();

    let task = h.scheduler.wait_for(id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task
        .cancel_reason
        .as_deref()
        .unwrap()
        .starts_with("timeout after"));
    assert_eq!(h.scheduler.running_count(), 0);
    wait_until(|| h.bridge.active() == 0).await;
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overdue_task_ignoring_stop_leaves_nothing_running() {
    let h = harness(
        fast_config().task_timeout(Duration::from_millis(100)),
        MockBridge::new(MockStep::hang().ignoring_stop()),
        false,
    );
    h.scheduler.start().unwrap();
    let id = h.scheduler.add_task(request("cc", 0)).unwrap();

    let task = h.scheduler.wait_for(id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task
        .cancel_reason
        .as_deref()
        .unwrap()
        .starts_with("timeout after"));
    assert_eq!(h.scheduler.running_count(), 0);

    // the bridge never returns; the task must stay settled regardless
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.scheduler.get_task_state(id), Some(TaskStatus::Cancelled));
    assert_eq!(h.scheduler.running_count(), 0);
    assert_eq!(h.history.count_for(id), 1);
    assert_eq!(h.bridge.call_count(), 1);
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bridge_error_fails_the_task_with_its_message() {
    let bridge = MockBridge::new(MockStep::succeed("ok"));
    bridge.script("flaky", MockStep::bridge_error("toolchain unavailable"));
    let h = harness(fast_config(), bridge, true);
    h.scheduler.start().unwrap();

    let id = h.scheduler.add_task(request("flaky", 0)).unwrap();
    let task = h.scheduler.wait_for(id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_output.contains("toolchain unavailable"));
    assert_eq!(task.exit_code, None);
    assert_eq!(h.history.count_for(id), 1);
    assert_eq!(h.bridge.call_count(), 1);
    assert!(h.scheduler.cache().unwrap().is_empty());
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn many_completions_in_one_tick_all_succeed() {
    let h = harness(
        fast_config().max_concurrent(400),
        MockBridge::new(MockStep::succeed("ok").with_delay(Duration::from_millis(50))),
        false,
    );
    for n in 0..400 {
        h.scheduler.add_task(request("cc", n)).unwrap();
    }
    h.scheduler.start().unwrap();

    let finished = h.scheduler.wait_all(WAIT).await.unwrap();
    assert_eq!(finished.len(), 400);
    let failed: Vec<&str> = finished
        .iter()
        .filter(|t| t.status != TaskStatus::Succeeded)
        .map(|t| t.error_output.as_str())
        .collect();
    assert!(failed.is_empty(), "unexpected failures: {:?}", &failed[..failed.len().min(3)]);
    assert_eq!(h.bridge.call_count(), 400);
    assert_eq!(h.scheduler.running_count(), 0);
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_leader_keeps_its_key_until_the_bridge_returns() {
    let h = harness(
        fast_config(),
        MockBridge::new(
            MockStep::succeed("built")
                .with_delay(Duration::from_millis(500))
                .ignoring_stop(),
        ),
        true,
    );
    h.scheduler.start().unwrap();

    let leader = h.scheduler.add_task(request("cc", 3)).unwrap();
    wait_until(|| h.scheduler.get_task_state(leader) == Some(TaskStatus::Running)).await;
    let follower = h.scheduler.add_task(request("cc", 3)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.scheduler.get_task_state(follower), Some(TaskStatus::Queued));

    assert!(h.scheduler.cancel_task(leader));
    assert_eq!(h.scheduler.running_count(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    // the cancelled run is still inside the bridge, so the duplicate waits
    assert_eq!(h.bridge.active(), 1);
    assert_eq!(h.bridge.call_count(), 1);
    assert_eq!(h.scheduler.get_task_state(follower), Some(TaskStatus::Queued));

    let follower_task = h.scheduler.wait_for(follower, WAIT).await.unwrap();
    assert_eq!(follower_task.status, TaskStatus::Succeeded);
    assert!(!follower_task.from_cache);
    assert_eq!(h.bridge.call_count(), 2);
    assert_eq!(h.bridge.peak_active(), 1);
    assert_eq!(h.scheduler.get_task_state(leader), Some(TaskStatus::Cancelled));
    assert_eq!(h.history.count_for(leader), 1);
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_waits_for_the_running_compile() {
    let h = harness(
        fast_config(),
        MockBridge::new(MockStep::succeed("built").with_delay(Duration::from_millis(200))),
        true,
    );
    h.scheduler.start().unwrap();

    let leader = h.scheduler.add_task(request("cc", 1)).unwrap();
    wait_until(|| h.scheduler.get_task_state(leader) == Some(TaskStatus::Running)).await;
    let follower = h.scheduler.add_task(request("cc", 1)).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.scheduler.get_task_state(follower), Some(TaskStatus::Queued));
    assert_eq!(h.scheduler.running_count(), 1);

    let leader_task = h.scheduler.wait_for(leader, WAIT).await.unwrap();
    let follower_task = h.scheduler.wait_for(follower, WAIT).await.unwrap();
    assert_eq!(h.bridge.call_count(), 1);
    assert_eq!(leader_task.status, TaskStatus::Succeeded);
    assert!(!leader_task.from_cache);
    assert_eq!(follower_task.status, TaskStatus::Succeeded);
    assert!(follower_task.from_cache);
    assert_eq!(follower_task.result, leader_task.result);
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_result_satisfies_admission() {
    let h = harness(fast_config(), MockBridge::default(), true);
    h.scheduler.start().unwrap();

    let first = h.scheduler.add_task(request("cc", 7)).unwrap();
    h.scheduler.wait_for(first, WAIT).await.unwrap();
    let cache = h.scheduler.cache().unwrap();
    assert_eq!(cache.len(), 1);

    let mut events = h.scheduler.subscribe();
    let second = h.scheduler.add_task(request("cc", 7)).unwrap();
    // completed before add_task returned
    assert_eq!(h.scheduler.get_task_state(second), Some(TaskStatus::Succeeded));
    assert!(h.scheduler.get_task(second).unwrap().from_cache);
    assert_eq!(h.bridge.call_count(), 1);
    assert_eq!(h.history.count_for(second), 1);

    let event = events.recv().await.unwrap().event;
    assert_eq!(
        event,
        SchedulerEvent::TaskSucceeded {
            task_id: second,
            duration_ms: 0,
            from_cache: true,
        }
    );
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_leader_requeues_its_duplicates() {
    let bridge = MockBridge::new(MockStep::succeed("ok"));
    bridge.script(
        "broken",
        MockStep::fail("main.c:1:1: error: nope", 1).with_delay(Duration::from_millis(150)),
    );
    let h = harness(fast_config(), bridge, true);
    h.scheduler.start().unwrap();

    let leader = h.scheduler.add_task(request("broken", 0)).unwrap();
    wait_until(|| h.scheduler.get_task_state(leader) == Some(TaskStatus::Running)).await;
    let follower = h.scheduler.add_task(request("broken", 0)).unwrap();

    let leader_task = h.scheduler.wait_for(leader, WAIT).await.unwrap();
    let follower_task = h.scheduler.wait_for(follower, WAIT).await.unwrap();

    assert_eq!(leader_task.status, TaskStatus::Failed);
    assert_eq!(leader_task.exit_code, Some(1));
    assert_eq!(leader_task.error_output, "main.c:1:1: error: nope");
    // the follower ran on its own and failed the same way
    assert_eq!(follower_task.status, TaskStatus::Failed);
    assert!(!follower_task.from_cache);
    assert_eq!(h.bridge.call_count(), 2);
    assert!(h.scheduler.cache().unwrap().is_empty());
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn cancelling_queued_and_unknown_tasks() {
    let h = harness(fast_config(), MockBridge::default(), false);
    let id = h.scheduler.add_task(request("cc", 0)).unwrap();

    assert!(h.scheduler.cancel_task(id));
    assert_eq!(h.scheduler.get_task_state(id), Some(TaskStatus::Cancelled));
    assert!(!h.scheduler.cancel_task(id));
    assert!(!h.scheduler.cancel_task(TaskId::new()));
    assert_eq!(h.scheduler.queued_count(), 0);
    assert_eq!(h.history.count_for(id), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_running_task_stops_the_bridge() {
    let h = harness(fast_config(), MockBridge::new(MockStep::hang()), false);
    h.scheduler.start().unwrap();
    let id = h.scheduler.add_task(request("cc", 0)).unwrap();
    wait_until(|| h.scheduler.get_task_state(id) == Some(TaskStatus::Running)).await;

    assert!(h.scheduler.cancel_task(id));
    assert_eq!(h.scheduler.running_count(), 0);
    let task = h.scheduler.get_task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    wait_until(|| h.bridge.active() == 0).await;

    // the late bridge result must not resurrect the task
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.scheduler.get_task_state(id), Some(TaskStatus::Cancelled));
    assert_eq!(h.history.count_for(id), 1);
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_holds_new_launches() {
    let h = harness(fast_config(), MockBridge::default(), false);
    let mut events = h.scheduler.subscribe();
    h.scheduler.start().unwrap();

    assert!(h.scheduler.pause());
    assert!(!h.scheduler.pause());
    assert_eq!(h.scheduler.state(), SchedulerState::Paused);
    let id = h.scheduler.add_task(request("cc", 0)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.scheduler.get_task_state(id), Some(TaskStatus::Queued));
    assert_eq!(h.bridge.call_count(), 0);

    assert!(h.scheduler.resume());
    let task = h.scheduler.wait_for(id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);

    let mut kinds = Vec::new();
    while let Ok(published) = events.try_recv() {
        kinds.push(published.event.kind());
    }
    assert_eq!(
        kinds,
        vec![
            "manager_paused",
            "task_added",
            "manager_resumed",
            "task_started",
            "task_succeeded"
        ]
    );
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn idle_with_an_empty_queue() {
    let h = harness(fast_config(), MockBridge::default(), false);
    h.scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(h.scheduler.state(), SchedulerState::Running);
    assert_eq!(h.scheduler.running_count(), 0);
    assert_eq!(h.scheduler.event_stats().events_published, 0);
    assert!(h.scheduler.get_all_tasks().is_empty());
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bridge_panic_fails_only_that_task() {
    let bridge = MockBridge::new(MockStep::succeed("ok"));
    bridge.script("explode", MockStep::panic());
    let h = harness(fast_config(), bridge, false);
    h.scheduler.start().unwrap();

    let bad = h.scheduler.add_task(request("explode", 0)).unwrap();
    let good = h.scheduler.add_task(request("cc", 1)).unwrap();

    let bad_task = h.scheduler.wait_for(bad, WAIT).await.unwrap();
    assert_eq!(bad_task.status, TaskStatus::Failed);
    assert!(bad_task.error_output.contains("panicked"));
    let good_task = h.scheduler.wait_for(good, WAIT).await.unwrap();
    assert_eq!(good_task.status, TaskStatus::Succeeded);
    assert_eq!(h.scheduler.state(), SchedulerState::Running);
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_is_published_between_start_and_finish() {
    let h = harness(
        fast_config(),
        MockBridge::new(MockStep::succeed("ok").with_progress([25.0, 75.0])),
        false,
    );
    let mut events = h.scheduler.subscribe();
    h.scheduler.start().unwrap();
    let id = h.scheduler.add_task(request("cc", 0)).unwrap();
    let task = h.scheduler.wait_for(id, WAIT).await.unwrap();
    assert_eq!(task.output, "ok");
    assert_eq!(task.result.as_ref().unwrap().counters.progress_events, 2);

    let mut kinds = Vec::new();
    while let Ok(published) = events.try_recv() {
        kinds.push(published.event.kind());
    }
    assert_eq!(
        kinds,
        vec![
            "task_added",
            "task_started",
            "task_progress",
            "task_progress",
            "task_succeeded"
        ]
    );
    h.scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_everything_and_is_idempotent() {
    let h = harness(
        fast_config().max_concurrent(1),
        MockBridge::new(MockStep::hang()),
        false,
    );
    h.scheduler.start().unwrap();
    let running = h.scheduler.add_task(request("cc", 0)).unwrap();
    let queued = h.scheduler.add_task(request("cc", 1)).unwrap();
    wait_until(|| h.scheduler.get_task_state(running) == Some(TaskStatus::Running)).await;

    h.scheduler.shutdown().await;
    assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    for id in [running, queued] {
        let task = h.scheduler.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.cancel_reason.as_deref(), Some(SHUTDOWN_REASON));
        assert_eq!(h.history.count_for(id), 1);
    }
    assert_eq!(h.scheduler.running_count(), 0);
    assert_eq!(h.scheduler.queued_count(), 0);

    h.scheduler.shutdown().await;
    assert!(h.scheduler.add_task(request("cc", 2)).is_err());
    assert!(h.scheduler.start().is_err());
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let h = harness(fast_config(), MockBridge::default(), false);
    let err = h
        .scheduler
        .add_task(CompileRequest::new("/proj", CompilerConfig::new("  ")))
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert!(h.scheduler.get_all_tasks().is_empty());
}

#[tokio::test]
async fn waiting_on_unknown_task_errors() {
    let h = harness(fast_config(), MockBridge::default(), false);
    let err = h
        .scheduler
        .wait_for(TaskId::new(), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TaskNotFound { .. }));
}
