use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use taskgroup::{
    AffinityHandle, GroupPolicy, GroupState, RenderSink, TaskError, TaskGroup, TaskOutcome,
    TaskState,
};
use tokio::time::Instant;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, PartialEq)]
enum Rendered {
    Text(String, String),
    Progress(u8),
    Notice(String),
    Button(String),
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<Rendered>>>,
}

impl Recorder {
    fn calls(&self) -> Vec<Rendered> {
        self.calls.lock().clone()
    }
}

impl RenderSink for Recorder {
    fn render_text(&mut self, view_id: &str, text: &str) {
        self.calls
            .lock()
            .push(Rendered::Text(view_id.to_string(), text.to_string()));
    }

    fn render_progress(&mut self, percent: u8) {
        self.calls.lock().push(Rendered::Progress(percent));
    }

    fn notify_user(&mut self, message: &str) {
        self.calls.lock().push(Rendered::Notice(message.to_string()));
    }

    fn set_button_label(&mut self, label: &str) {
        self.calls.lock().push(Rendered::Button(label.to_string()));
    }
}

/// Three tasks with 500/1000/1500 ms delays, the second one failing. Under
/// fail-fast the group resolves with the failure at the 1000 ms mark and the
/// slowest task ends up Cancelled rather than left Running.
#[tokio::test(start_paused = true)]
async fn fail_fast_resolves_at_first_failure() {
    init_logs();
    let group = TaskGroup::new(GroupPolicy::FailFast);
    let started = Instant::now();

    let fast = group
        .spawn("fast", |_token| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(10u32)
        })
        .unwrap();
    group
        .spawn("faulty", |_token| async {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            Err(TaskError::WorkFailure("exception for digit 2".to_string()))
        })
        .unwrap();
    let slow = group
        .spawn("slow", |_token| async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Ok(30u32)
        })
        .unwrap();

    let error = group.await_all().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(error, TaskError::WorkFailure(message) if message.contains("digit 2")));
    assert!(
        elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(1400),
        "resolved at {elapsed:?}, expected around 1000ms"
    );
    // The task that finished before the failure keeps its result
    assert_eq!(fast.state(), TaskState::Completed);
    assert_eq!(slow.state(), TaskState::Cancelled);
    assert_eq!(group.aggregate_state(), GroupState::Failed);
}

/// Same three tasks under isolation: the failure is reported alongside the
/// successes and the group runs to the 1500 ms mark.
#[tokio::test(start_paused = true)]
async fn isolate_failures_waits_for_all() {
    init_logs();
    let group = TaskGroup::new(GroupPolicy::IsolateFailures);
    let started = Instant::now();

    for (name, delay, value) in [("one", 500u64, 10u32), ("two", 1000, 20), ("three", 1500, 30)] {
        group
            .spawn(name, move |_token| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if name == "two" {
                    Err(TaskError::WorkFailure(format!("exception in task {name}")))
                } else {
                    Ok(value)
                }
            })
            .unwrap();
    }

    let pairs = group.await_all().await.unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_millis(1900),
        "resolved at {elapsed:?}, expected around 1500ms"
    );
    assert_eq!(pairs.len(), 3);
    assert!(pairs[0].1.is_completed());
    assert!(pairs[1].1.is_failed());
    assert!(pairs[2].1.is_completed());
    assert_eq!(group.aggregate_state(), GroupState::Completed);
}

/// Two concurrent partial sums (1..=100 ascending and 200..=150 descending)
/// combine into 6975, delivered through a single render call once both
/// finish.
#[tokio::test(start_paused = true)]
async fn partial_sums_combine_into_one_render() {
    init_logs();
    let recorder = Recorder::default();
    let ui = AffinityHandle::spawn(recorder.clone());
    let group = TaskGroup::with_render(GroupPolicy::FailFast, ui.clone());

    group
        .spawn("increment", |_token| async {
            let mut sum = 0u32;
            for i in 1..=100u32 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                sum += i;
            }
            Ok(sum)
        })
        .unwrap();
    group
        .spawn("decrement", |_token| async {
            let mut sum = 0u32;
            let mut i = 200u32;
            while i >= 150 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                sum += i;
                i -= 5;
            }
            Ok(sum)
        })
        .unwrap();

    let pairs = group.await_all().await.unwrap();
    let total: u32 = pairs
        .iter()
        .filter_map(|(_, outcome)| outcome.value().copied())
        .sum();
    assert_eq!(total, 6975);

    ui.render_text("tv_total_sum", &format!("Total Sum : {total}"));
    ui.flushed().await;

    let calls = recorder.calls();
    let texts: Vec<&Rendered> = calls
        .iter()
        .filter(|call| matches!(call, Rendered::Text(..)))
        .collect();
    assert_eq!(
        texts,
        vec![&Rendered::Text(
            "tv_total_sum".to_string(),
            "Total Sum : 6975".to_string()
        )]
    );
}

/// The single-task path: a simulated slow fetch whose result lands in one
/// text view on the affinity context.
#[tokio::test(start_paused = true)]
async fn single_task_result_rendered_on_affinity() {
    init_logs();
    let recorder = Recorder::default();
    let ui = AffinityHandle::spawn(recorder.clone());
    let group = TaskGroup::with_render(GroupPolicy::FailFast, ui.clone());

    let handle = group
        .spawn("fetch", |_token| async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Ok("Hello from fake API call".to_string())
        })
        .unwrap();

    handle.wait_terminal().await;
    let fetched = handle
        .outcome()
        .and_then(|outcome| outcome.value().cloned())
        .unwrap_or_default();
    ui.render_text("tv_basic", &fetched);
    ui.flushed().await;

    assert_eq!(
        recorder.calls(),
        vec![Rendered::Text(
            "tv_basic".to_string(),
            "Hello from fake API call".to_string()
        )]
    );
}

/// A 100-tick progress run with a 40 ms interval reports exactly 0..=100 in
/// order, bracketed by the button relabeling the original UI performed.
#[tokio::test(start_paused = true)]
async fn progress_run_reports_every_value() {
    init_logs();
    let recorder = Recorder::default();
    let ui = AffinityHandle::spawn(recorder.clone());
    let group = TaskGroup::with_render(GroupPolicy::IsolateFailures, ui.clone());

    ui.set_button_label("Cancel Job");
    let handle = group
        .drive_progress(100, Duration::from_millis(40), || {})
        .unwrap();
    handle.wait_terminal().await;
    ui.set_button_label("Reset Job");
    ui.flushed().await;

    assert_eq!(handle.outcome(), Some(TaskOutcome::Completed(100)));

    let calls = recorder.calls();
    assert_eq!(calls.first(), Some(&Rendered::Button("Cancel Job".to_string())));
    assert_eq!(calls.last(), Some(&Rendered::Button("Reset Job".to_string())));
    let percents: Vec<u8> = calls
        .iter()
        .filter_map(|call| match call {
            Rendered::Progress(percent) => Some(*percent),
            _ => None,
        })
        .collect();
    let expected: Vec<u8> = (0..=100u8).collect();
    assert_eq!(percents, expected);
}

/// Cancelling the progress run at the halfway mark stops the sequence at or
/// before 50 and nothing further is reported.
#[tokio::test(start_paused = true)]
async fn progress_run_cancel_at_halfway() {
    init_logs();
    let recorder = Recorder::default();
    let ui = AffinityHandle::spawn(recorder.clone());
    let group = TaskGroup::with_render(GroupPolicy::IsolateFailures, ui.clone());

    let handle = group
        .drive_progress(100, Duration::from_millis(40), || {})
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40 * 50 + 5)).await;
    handle.cancel("reset pressed");
    handle.wait_terminal().await;
    ui.flushed().await;

    assert_eq!(handle.state(), TaskState::Cancelled);
    let percents: Vec<u8> = recorder
        .calls()
        .iter()
        .filter_map(|call| match call {
            Rendered::Progress(percent) => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(*percents.last().unwrap() <= 50);
    for pair in percents.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }

    let frozen = percents.len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    ui.flushed().await;
    let after: Vec<u8> = recorder
        .calls()
        .iter()
        .filter_map(|call| match call {
            Rendered::Progress(percent) => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(after.len(), frozen);
}

/// A bounded wait that elapses cancels the stragglers with reason "timeout"
/// and notifies the user, never surfacing an uncaught fault.
#[tokio::test(start_paused = true)]
async fn timeout_resolves_as_cancellation() {
    init_logs();
    let recorder = Recorder::default();
    let ui = AffinityHandle::spawn(recorder.clone());
    let group = TaskGroup::with_render(GroupPolicy::FailFast, ui.clone());

    let handle = group
        .spawn("slow fetch", |_token| async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Ok("too late".to_string())
        })
        .unwrap();

    let error = group
        .await_all_timeout(Duration::from_millis(1000))
        .await
        .unwrap_err();

    assert!(matches!(error, TaskError::Timeout(limit) if limit == Duration::from_millis(1000)));
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert_eq!(
        handle.outcome(),
        Some(TaskOutcome::Cancelled {
            reason: "timeout".to_string()
        })
    );
    assert_eq!(group.aggregate_state(), GroupState::Cancelled);

    ui.flushed().await;
    assert!(recorder
        .calls()
        .iter()
        .any(|call| matches!(call, Rendered::Notice(message) if message.contains("timeout"))));
}

/// A panicking member under isolation becomes Failed without disturbing its
/// sibling or the caller.
#[tokio::test]
async fn panic_is_contained_under_isolation() {
    init_logs();
    let group = TaskGroup::new(GroupPolicy::IsolateFailures);

    let panicker = group
        .spawn("panicker", |_token| async {
            if true {
                panic!("arithmetic went sideways");
            }
            Ok(0u32)
        })
        .unwrap();
    let steady = group
        .spawn("steady", |_token| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(7u32)
        })
        .unwrap();

    let pairs = group.await_all().await.unwrap();
    assert_eq!(pairs.len(), 2);
    assert_eq!(panicker.state(), TaskState::Failed);
    assert!(panicker
        .info()
        .error
        .unwrap_or_default()
        .contains("arithmetic went sideways"));
    assert_eq!(steady.state(), TaskState::Completed);
}

/// Completion callbacks fire exactly once per handle, after the terminal
/// transition, across a cancel/finish race.
#[tokio::test]
async fn completion_callbacks_fire_exactly_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    init_logs();
    let group = TaskGroup::new(GroupPolicy::IsolateFailures);
    let fired = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..8u32 {
        let handle = group
            .spawn(format!("task-{i}"), move |_token| async move {
                tokio::time::sleep(Duration::from_millis(5 + i as u64)).await;
                Ok(i)
            })
            .unwrap();
        let fired_clone = fired.clone();
        handle.on_completion(move |state, _error| {
            assert!(state.is_terminal());
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        handles.push(handle);
    }

    // Cancel half of them while they run; callbacks still fire exactly once
    for handle in handles.iter().take(4) {
        handle.cancel("raced");
    }
    group.await_all().await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 8);
}

/// Cancelling the whole group reaches the collaborator through notify_user,
/// the way the original surfaced a cancelled job as a toast.
#[tokio::test]
async fn cancel_all_notifies_user() {
    init_logs();
    let recorder = Recorder::default();
    let ui = AffinityHandle::spawn(recorder.clone());
    let group = TaskGroup::with_render(GroupPolicy::FailFast, ui.clone());

    group
        .spawn("job", |_token| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1u32)
        })
        .unwrap();

    assert_eq!(group.cancel_all("Job Cancelled"), 1);
    ui.flushed().await;

    assert!(recorder
        .calls()
        .iter()
        .any(|call| matches!(call, Rendered::Notice(message) if message.contains("Job Cancelled"))));

    let error = group.spawn("late", |_token| async { Ok(2u32) }).unwrap_err();
    assert!(matches!(error, TaskError::GroupClosed));
}
