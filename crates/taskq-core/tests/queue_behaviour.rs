//! End-to-end behaviour of a running queue: admission, dispatch, retries,
//! dependencies, coalescing, persistence and restart.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskq_core::impls::MemoryStore;
use taskq_core::ports::PersistenceProvider;
use taskq_core::{
    Admission, CoalescingHandler, Queue, QueueConfig, QueuePriority, RetryPolicy, Task,
    TaskError, TaskHandler, TaskId, TaskRecord, TaskState, coalesce_fn, handler_fn,
};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

type Done = mpsc::UnboundedReceiver<(TaskId, Option<TaskError>)>;

fn config(name: &str) -> QueueConfig {
    QueueConfig::new(name)
        .with_max_retries(3)
        .with_retry_policy(RetryPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
        ))
}

/// Builder with a persistence store and a completion channel attached.
fn builder(config: QueueConfig, store: &Arc<MemoryStore>) -> (taskq_core::QueueBuilder, Done) {
    let (tx, rx) = mpsc::unbounded_channel();
    let builder = Queue::builder(config)
        .persistence(store.clone())
        .on_complete(move |err, task| {
            let _ = tx.send((task.id().clone(), err.cloned()));
        });
    (builder, rx)
}

/// Handler that hands every dispatched task to the test, which completes it.
fn manual() -> (Arc<dyn TaskHandler>, mpsc::UnboundedReceiver<Task>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn TaskHandler> = handler_fn(move |task: Task| {
        let _ = tx.send(task);
    });
    (handler, rx)
}

async fn next_done(done: &mut Done) -> (TaskId, Option<TaskError>) {
    tokio::time::timeout(WAIT, done.recv())
        .await
        .expect("timed out waiting for a terminal task")
        .expect("completion channel closed")
}

async fn next_started(started: &mut mpsc::UnboundedReceiver<Task>) -> Task {
    tokio::time::timeout(WAIT, started.recv())
        .await
        .expect("timed out waiting for dispatch")
        .expect("handler channel closed")
}

async fn wait_for_state(task: &Task, state: TaskState) {
    tokio::time::timeout(WAIT, async {
        while task.state() != state {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("task never reached the expected state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_task_is_visible_until_terminal_and_mirrored_in_store() {
    let store = Arc::new(MemoryStore::new());
    let (handler, mut started) = manual();
    let (builder, mut done) = builder(config("uploads"), &store);
    let queue = builder.handler("upload", handler).unwrap().build().unwrap();

    let admission = queue.add_task(Task::builder("upload").id("t1").build());
    assert_eq!(admission, Admission::Admitted(TaskId::new("t1")));
    assert!(queue.get_task("t1").is_some());
    assert_eq!(store.task_ids("uploads"), vec![TaskId::new("t1")]);

    let task = next_started(&mut started).await;
    assert!(task.is_executing());
    assert!(task.started().is_some());
    assert!(queue.get_task("t1").is_some());

    task.completed(None);
    let (id, err) = next_done(&mut done).await;
    assert_eq!(id.as_str(), "t1");
    assert_eq!(err, None);
    assert!(queue.get_task("t1").is_none());
    assert!(queue.is_empty());
    assert_eq!(store.len("uploads"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_id_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let (handler, mut started) = manual();
    let (builder, _done) = builder(config("q"), &store);
    let queue = builder.handler("upload", handler).unwrap().build().unwrap();

    assert!(queue.add_task(Task::builder("upload").id("dup").build()).is_admitted());
    let first = next_started(&mut started).await;

    let second = queue.add_task(Task::builder("upload").id("dup").build());
    assert_eq!(second, Admission::Rejected(TaskId::new("dup")));
    assert_eq!(queue.len(), 1);
    assert!(queue.get_task("dup").unwrap().ptr_eq(&first));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_task_cannot_be_resubmitted() {
    let store = Arc::new(MemoryStore::new());
    let (builder, _done) = builder(config("q"), &store);
    let queue = builder.build().unwrap();

    let task = Task::builder("upload").id("gone").build();
    task.cancel();
    assert!(!queue.add_task(task).is_admitted());
    assert!(queue.is_empty());
    assert_eq!(store.len("q"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_handler_cancels_without_retry() {
    let store = Arc::new(MemoryStore::new());
    let (builder, mut done) = builder(config("q"), &store);
    let queue = builder.build().unwrap();

    let task = Task::builder("unknown").id("orphan").build();
    queue.add_task(task.clone());

    let (id, err) = next_done(&mut done).await;
    assert_eq!(id.as_str(), "orphan");
    assert!(matches!(err, Some(TaskError::NoHandler { task_type }) if task_type.as_str() == "unknown"));
    assert!(task.is_cancelled());
    assert_eq!(task.retry_count(), 0);
    assert_eq!(store.len("q"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn always_failing_handler_runs_exactly_max_retries_times() {
    let store = Arc::new(MemoryStore::new());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let (builder, mut done) = builder(config("q"), &store);
    let queue = builder
        .handler(
            "flaky",
            handler_fn(move |task: Task| {
                counter.fetch_add(1, Ordering::SeqCst);
                task.completed(Some(TaskError::failed("boom")));
            }),
        )
        .unwrap()
        .build()
        .unwrap();

    let task = Task::builder("flaky").id("f").build();
    queue.add_task(task.clone());

    let (_, err) = next_done(&mut done).await;
    match err {
        Some(TaskError::RetriesExhausted { retries, last }) => {
            assert_eq!(retries, 3);
            assert_eq!(*last, TaskError::failed("boom"));
        }
        other => panic!("unexpected terminal error: {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(task.retry_count(), 3);
    assert!(task.is_cancelled());
    assert!(queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_succeeding_after_failures_finishes() {
    let store = Arc::new(MemoryStore::new());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let (builder, mut done) = builder(config("q"), &store);
    let queue = builder
        .handler(
            "flaky",
            handler_fn(move |task: Task| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    task.completed(Some(TaskError::failed("not yet")));
                } else {
                    task.completed(None);
                }
            }),
        )
        .unwrap()
        .build()
        .unwrap();

    let task = Task::builder("flaky").id("f").build();
    queue.add_task(task.clone());

    let (_, err) = next_done(&mut done).await;
    assert_eq!(err, None);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(task.retry_count(), 2);
    assert_eq!(task.last_error(), None);
    assert_eq!(task.state(), TaskState::Finished);
}

#[tokio::test(start_paused = true)]
async fn backoff_between_attempts_doubles_from_the_minimum() {
    let store = Arc::new(MemoryStore::new());
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let recorder = stamps.clone();
    let (builder, mut done) = builder(
        QueueConfig::new("q").with_max_retries(4),
        &store,
    );
    let queue = builder
        .handler(
            "flaky",
            handler_fn(move |task: Task| {
                recorder.lock().unwrap().push(tokio::time::Instant::now());
                task.completed(Some(TaskError::failed("boom")));
            }),
        )
        .unwrap()
        .build()
        .unwrap();

    queue.add_task(Task::builder("flaky").id("f").build());
    next_done(&mut done).await;

    let stamps = stamps.lock().unwrap().clone();
    assert_eq!(stamps.len(), 4);
    let expected = [200, 400, 800].map(Duration::from_millis);
    for (pair, want) in stamps.windows(2).zip(expected) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= want && gap < want + Duration::from_millis(20),
            "gap {gap:?}, expected about {want:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_wait_releases_the_slot_and_refreshes_the_stored_record() {
    let store = Arc::new(MemoryStore::new());
    let failed_once = Arc::new(AtomicU32::new(0));
    let flag = failed_once.clone();
    let (other, mut started) = manual();
    let (builder, _done) = builder(
        config("q").with_retry_policy(RetryPolicy::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
        )),
        &store,
    );
    let queue = builder
        .handler(
            "flaky",
            handler_fn(move |task: Task| {
                flag.fetch_add(1, Ordering::SeqCst);
                task.completed(Some(TaskError::failed("boom")));
            }),
        )
        .unwrap()
        .handler("other", other)
        .unwrap()
        .build()
        .unwrap();

    let flaky = Task::builder("flaky").id("f").build();
    queue.add_task(flaky.clone());
    wait_for_state(&flaky, TaskState::RetryWait).await;

    // The single slot is free while `f` waits out its backoff.
    queue.add_task(Task::builder("other").id("o").build());
    let o = next_started(&mut started).await;
    assert_eq!(o.id().as_str(), "o");

    let raw = store.load_all("q").unwrap();
    let record = raw
        .iter()
        .map(|r| TaskRecord::from_json(r).unwrap())
        .find(|r| r.task_id.as_str() == "f")
        .unwrap();
    assert_eq!(record.retries, 1);
    assert!(record.started.is_some());
    assert_eq!(failed_once.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_backoff_stops_retries() {
    let store = Arc::new(MemoryStore::new());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let (builder, mut done) = builder(
        config("q").with_retry_policy(RetryPolicy::new(
            Duration::from_millis(300),
            Duration::from_millis(300),
        )),
        &store,
    );
    let queue = builder
        .handler(
            "flaky",
            handler_fn(move |task: Task| {
                counter.fetch_add(1, Ordering::SeqCst);
                task.completed(Some(TaskError::failed("boom")));
            }),
        )
        .unwrap()
        .build()
        .unwrap();

    let task = Task::builder("flaky").id("f").build();
    queue.add_task(task.clone());
    wait_for_state(&task, TaskState::RetryWait).await;
    assert!(queue.cancel("f"));

    let (_, err) = next_done(&mut done).await;
    assert_eq!(err, Some(TaskError::Cancelled));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(!queue.cancel("f"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependents_wait_for_every_dependency_to_terminate() {
    let store = Arc::new(MemoryStore::new());
    let (handler, mut started) = manual();
    let (builder, mut done) = builder(
        config("q").with_max_concurrency(3).with_max_retries(1),
        &store,
    );
    let queue = builder.handler("step", handler).unwrap().build().unwrap();

    queue.add_task(Task::builder("step").id("a").build());
    queue.add_task(Task::builder("step").id("b").build());
    let c = Task::builder("step")
        .id("c")
        .depends_on("a")
        .depends_on("b")
        .depends_on("never-submitted")
        .build();
    queue.add_task(c.clone());

    let first = next_started(&mut started).await;
    let second = next_started(&mut started).await;
    let mut ids = vec![first.id().to_string(), second.id().to_string()];
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(c.state(), TaskState::Created);

    let (a, b) = if first.id().as_str() == "a" {
        (first, second)
    } else {
        (second, first)
    };

    a.completed(None);
    next_done(&mut done).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(c.state(), TaskState::Created);

    // A failed dependency unblocks just like a successful one.
    b.completed(Some(TaskError::failed("broken")));
    let (id, err) = next_done(&mut done).await;
    assert_eq!(id.as_str(), "b");
    assert!(matches!(err, Some(TaskError::RetriesExhausted { .. })));

    let c_running = next_started(&mut started).await;
    assert!(c_running.ptr_eq(&c));
    c_running.completed(None);
    assert_eq!(next_done(&mut done).await.0.as_str(), "c");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_restores_tasks_and_dependency_edges() {
    let store = Arc::new(MemoryStore::new());

    let (handler, mut started) = manual();
    let (builder1, _done1) = builder(config("jobs"), &store);
    let first = builder1.handler("job", handler).unwrap().build().unwrap();
    first.add_task(Task::builder("job").id("t1").build());
    first.add_task(
        Task::builder("job")
            .id("t2")
            .depends_on("t1")
            .priority(QueuePriority::High)
            .payload(serde_json::json!({"n": 2}))
            .build(),
    );
    let t1_before = next_started(&mut started).await;
    assert_eq!(t1_before.id().as_str(), "t1");
    assert_eq!(store.len("jobs"), 2);
    let t2_record = first.get_task("t2").unwrap().to_record();

    // A new process over the same store.
    let (handler, mut started) = manual();
    let (builder2, mut done2) = builder(config("jobs"), &store);
    let second = builder2.handler("job", handler).unwrap().build().unwrap();
    assert_eq!(second.load_persisted_tasks().unwrap(), 2);
    assert_eq!(second.len(), 2);
    assert_eq!(second.get_task("t2").unwrap().to_record(), t2_record);

    let t1 = next_started(&mut started).await;
    assert_eq!(t1.id().as_str(), "t1");
    let t2 = second.get_task("t2").unwrap();
    assert_eq!(t2.state(), TaskState::Created);

    t1.completed(None);
    assert_eq!(next_done(&mut done2).await.0.as_str(), "t1");
    let t2_running = next_started(&mut started).await;
    assert!(t2_running.ptr_eq(&t2));
    t2_running.completed(None);
    assert_eq!(next_done(&mut done2).await.0.as_str(), "t2");
    assert_eq!(store.len("jobs"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_persisted_records_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    store.insert_raw("q", "bad", "{not json");
    store
        .save(&Task::builder("job").id("good").build(), "q")
        .unwrap();

    let (handler, _started) = manual();
    let (builder, _done) = builder(config("q"), &store);
    let queue = builder.handler("job", handler).unwrap().build().unwrap();

    assert_eq!(queue.load_persisted_tasks().unwrap(), 1);
    assert!(queue.get_task("good").is_some());
    assert!(queue.get_task("bad").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coalescing_replaces_idle_tasks_of_the_same_type() {
    let store = Arc::new(MemoryStore::new());
    let (gate, mut started) = manual();
    let (sync, _synced) = manual();
    let (builder, mut done) = builder(config("q"), &store);
    let queue = builder
        .handler("gate", gate)
        .unwrap()
        .handler("sync", sync)
        .unwrap()
        .build()
        .unwrap();

    // Hold the only slot so the sync tasks stay pending.
    queue.add_task(Task::builder("gate").id("gate").build());
    let gate_task = next_started(&mut started).await;
    let originals: Vec<Task> = ["s1", "s2", "s3"]
        .iter()
        .map(|id| Task::builder("sync").id(*id).build())
        .collect();
    for task in &originals {
        assert!(queue.add_task(task.clone()).is_admitted());
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    queue
        .add_coalescing_handler(
            "sync",
            coalesce_fn(move |tasks: &[Task]| {
                counter.store(tasks.len(), Ordering::SeqCst);
                Task::builder("sync").id("merged").build()
            }),
        )
        .unwrap();

    let incoming = Task::builder("sync").id("s4").build();
    let admission = queue.add_task(incoming.clone());
    assert_eq!(admission, Admission::Admitted(TaskId::new("merged")));
    assert_eq!(seen.load(Ordering::SeqCst), 4);

    for task in &originals {
        assert!(task.is_cancelled());
        assert_eq!(
            task.last_error(),
            Some(TaskError::Coalesced {
                into: TaskId::new("merged")
            })
        );
    }
    assert!(incoming.is_cancelled());

    let mut cancelled = Vec::new();
    for _ in 0..3 {
        cancelled.push(next_done(&mut done).await.0.to_string());
    }
    cancelled.sort();
    assert_eq!(cancelled, vec!["s1", "s2", "s3"]);

    let mut live: Vec<String> = queue.task_ids().iter().map(|id| id.to_string()).collect();
    live.sort();
    assert_eq!(live, vec!["gate", "merged"]);
    let mut stored: Vec<String> = store.task_ids("q").iter().map(|id| id.to_string()).collect();
    stored.sort();
    assert_eq!(stored, vec!["gate", "merged"]);

    gate_task.completed(None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coalescer_may_keep_an_existing_task() {
    let store = Arc::new(MemoryStore::new());
    let (gate, mut started) = manual();
    let (sync, _synced) = manual();
    let (builder, _done) = builder(config("q"), &store);
    let queue = builder
        .handler("gate", gate)
        .unwrap()
        .handler("sync", sync)
        .unwrap()
        .coalescer("sync", coalesce_fn(|tasks: &[Task]| tasks[0].clone()))
        .unwrap()
        .build()
        .unwrap();

    queue.add_task(Task::builder("gate").id("gate").build());
    next_started(&mut started).await;

    let oldest = Task::builder("sync").id("s1").build();
    queue.add_task(oldest.clone());
    let admission = queue.add_task(Task::builder("sync").id("s2").build());

    assert_eq!(admission, Admission::Admitted(TaskId::new("s1")));
    assert!(!oldest.is_finished());
    assert!(queue.get_task("s1").unwrap().ptr_eq(&oldest));
    assert!(queue.get_task("s2").is_none());
    assert_eq!(queue.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resubmitting_the_same_live_task_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let (gate, mut started) = manual();
    let (sync, _synced) = manual();
    let (builder, _done) = builder(config("q"), &store);
    let queue = builder
        .handler("gate", gate)
        .unwrap()
        .handler("sync", sync)
        .unwrap()
        .coalescer("sync", coalesce_fn(|tasks: &[Task]| tasks[0].clone()))
        .unwrap()
        .build()
        .unwrap();

    queue.add_task(Task::builder("gate").id("gate").build());
    next_started(&mut started).await;

    let pending = Task::builder("sync").id("s1").build();
    assert!(queue.add_task(pending.clone()).is_admitted());
    let again = queue.add_task(pending.clone());

    assert_eq!(again, Admission::Rejected(TaskId::new("s1")));
    assert!(!pending.is_finished());
    assert_eq!(queue.len(), 2);
}

/// Poll until every task has left the queue.
async fn wait_until_empty(queue: &Queue) {
    tokio::time::timeout(WAIT, async {
        while !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("queue never drained");
}

/// Coalescer that always builds a fresh `merged-N` task and records the
/// largest number of pending candidates it was shown.
fn merging_coalescer(widest: Arc<AtomicUsize>) -> Arc<dyn CoalescingHandler> {
    let next = Arc::new(AtomicUsize::new(0));
    coalesce_fn(move |tasks: &[Task]| {
        widest.fetch_max(tasks.len() - 1, Ordering::SeqCst);
        // Widen the window a concurrent submitter could slip through.
        std::thread::sleep(Duration::from_millis(2));
        let n = next.fetch_add(1, Ordering::SeqCst);
        Task::builder("sync").id(format!("merged-{n}")).build()
    })
}

/// Submit `per_thread` sync tasks from each of `threads` OS threads at once.
fn submit_concurrently(queue: &Queue, threads: usize, per_thread: usize) -> Vec<Task> {
    let submitters: Vec<_> = (0..threads)
        .map(|t| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                (0..per_thread)
                    .map(|i| {
                        let task = Task::builder("sync").id(format!("s{t}-{i}")).build();
                        queue.add_task(task.clone());
                        task
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    submitters
        .into_iter()
        .flat_map(|s| s.join().unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_coalesce_into_a_single_pending_task() {
    let store = Arc::new(MemoryStore::new());
    let (gate, mut started) = manual();
    let invoked = Arc::new(Mutex::new(Vec::<Task>::new()));
    let seen = invoked.clone();
    let widest = Arc::new(AtomicUsize::new(0));
    let (builder, _done) = builder(config("q"), &store);
    let queue = builder
        .handler("gate", gate)
        .unwrap()
        .handler(
            "sync",
            handler_fn(move |task: Task| {
                seen.lock().unwrap().push(task.clone());
                task.completed(None);
            }),
        )
        .unwrap()
        .coalescer("sync", merging_coalescer(widest.clone()))
        .unwrap()
        .build()
        .unwrap();

    // Hold the only slot so every sync task stays pending.
    queue.add_task(Task::builder("gate").id("gate").build());
    let gate_task = next_started(&mut started).await;

    let submitted = submit_concurrently(&queue, 4, 5);

    let pending: Vec<TaskId> = queue
        .task_ids()
        .into_iter()
        .filter(|id| id.as_str() != "gate")
        .collect();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].as_str().starts_with("merged-"));
    assert_eq!(widest.load(Ordering::SeqCst), 1);
    assert_eq!(store.len("q"), 2);
    for task in &submitted {
        assert!(task.is_cancelled());
        assert!(matches!(task.last_error(), Some(TaskError::Coalesced { .. })));
    }

    gate_task.completed(None);
    wait_until_empty(&queue).await;

    let invoked = invoked.lock().unwrap();
    assert_eq!(invoked.len(), 1);
    assert_eq!(invoked[0].id(), &pending[0]);
    assert_eq!(invoked[0].state(), TaskState::Finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coalesced_tasks_never_reach_their_handler() {
    let store = Arc::new(MemoryStore::new());
    let invoked = Arc::new(Mutex::new(Vec::<Task>::new()));
    let seen = invoked.clone();
    let widest = Arc::new(AtomicUsize::new(0));
    let (builder, _done) = builder(config("q").with_max_concurrency(2), &store);
    let queue = builder
        .handler(
            "sync",
            handler_fn(move |task: Task| {
                seen.lock().unwrap().push(task.clone());
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(3));
                    task.completed(None);
                });
            }),
        )
        .unwrap()
        .coalescer("sync", merging_coalescer(widest.clone()))
        .unwrap()
        .build()
        .unwrap();

    let submitted = submit_concurrently(&queue, 4, 10);
    wait_until_empty(&queue).await;

    assert!(widest.load(Ordering::SeqCst) <= 1);
    let invoked = invoked.lock().unwrap();
    assert!(!invoked.is_empty());
    for task in invoked.iter() {
        assert_eq!(task.state(), TaskState::Finished, "task {}", task.id());
        assert_eq!(task.last_error(), None);
    }
    let mut ids: Vec<&TaskId> = invoked.iter().map(|t| t.id()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), invoked.len());
    for task in &submitted {
        assert!(task.is_finished());
    }
    assert_eq!(store.len("q"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_completion_does_not_notify_twice() {
    let store = Arc::new(MemoryStore::new());
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let queue = Queue::builder(config("q"))
        .persistence(store.clone())
        .on_complete(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .handler(
            "twice",
            handler_fn(|task: Task| {
                task.completed(None);
                task.completed(None);
                task.completed(Some(TaskError::failed("late")));
            }),
        )
        .unwrap()
        .build()
        .unwrap();

    let task = Task::builder("twice").id("t").build();
    queue.add_task(task.clone());
    wait_for_state(&task, TaskState::Finished).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(task.retry_count(), 0);
    assert_eq!(task.last_error(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_tasks_dispatch_by_priority_then_submission_order() {
    let store = Arc::new(MemoryStore::new());
    let (gate, mut gate_started) = manual();
    let order = Arc::new(Mutex::new(Vec::new()));
    let recorder = order.clone();
    let (builder, mut done) = builder(config("q"), &store);
    let queue = builder
        .handler("gate", gate)
        .unwrap()
        .handler(
            "work",
            handler_fn(move |task: Task| {
                recorder.lock().unwrap().push(task.id().to_string());
                task.completed(None);
            }),
        )
        .unwrap()
        .build()
        .unwrap();

    queue.add_task(Task::builder("gate").id("gate").build());
    let gate_task = next_started(&mut gate_started).await;
    for (id, priority) in [
        ("low", QueuePriority::Low),
        ("normal-1", QueuePriority::Normal),
        ("high", QueuePriority::VeryHigh),
        ("normal-2", QueuePriority::Normal),
    ] {
        queue.add_task(Task::builder("work").id(id).priority(priority).build());
    }

    gate_task.completed(None);
    for _ in 0..5 {
        next_done(&mut done).await;
    }
    assert_eq!(
        *order.lock().unwrap(),
        vec!["high", "normal-1", "normal-2", "low"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_stays_bounded_with_completions_from_other_threads() {
    let store = Arc::new(MemoryStore::new());
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    let (builder, mut done) = builder(config("q").with_max_concurrency(2), &store);
    let queue = builder
        .handler(
            "work",
            handler_fn(move |task: Task| {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                let r = r.clone();
                // Fire, return, complete later from a plain OS thread.
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(15));
                    r.fetch_sub(1, Ordering::SeqCst);
                    task.completed(None);
                });
            }),
        )
        .unwrap()
        .build()
        .unwrap();

    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..5 {
                    let id = format!("w{t}-{i}");
                    assert!(queue.add_task(Task::builder("work").id(id).build()).is_admitted());
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }

    for _ in 0..20 {
        let (_, err) = next_done(&mut done).await;
        assert_eq!(err, None);
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(queue.is_empty());
    assert_eq!(store.len("q"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_counts_as_a_failed_attempt() {
    let store = Arc::new(MemoryStore::new());
    let (builder, mut done) = builder(config("q").with_max_retries(1), &store);
    let queue = builder
        .handler("boom", handler_fn(|_task: Task| panic!("handler blew up")))
        .unwrap()
        .build()
        .unwrap();

    queue.add_task(Task::builder("boom").id("p").build());
    let (_, err) = next_done(&mut done).await;
    assert!(matches!(
        err,
        Some(TaskError::RetriesExhausted { retries: 1, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_handler_registration_is_used_on_next_dispatch() {
    let store = Arc::new(MemoryStore::new());
    let (builder, mut done) = builder(config("q"), &store);
    let queue = builder.build().unwrap();

    queue
        .add_task_handler("late", handler_fn(|task: Task| task.completed(None)))
        .unwrap();
    assert!(
        queue
            .add_task_handler("late", handler_fn(|task: Task| task.completed(None)))
            .is_err()
    );

    queue.add_task(Task::builder("late").id("l").build());
    assert_eq!(next_done(&mut done).await, (TaskId::new("l"), None));
}
