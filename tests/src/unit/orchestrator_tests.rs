use super::{harness, login};
use smartops_core::protocol::{TaskContext, TaskReply, TaskSnapshot};
use smartops_core::{Provider, TaskKind, TaskStatus};
use std::time::Duration;

fn reply(status: TaskStatus, result: &str) -> TaskReply {
    TaskReply {
        status,
        result: Some(result.to_owned()),
        structured: Default::default(),
        suggestions: Vec::new(),
    }
}

fn snapshot(task_id: &str, status: TaskStatus) -> TaskSnapshot {
    TaskSnapshot {
        task_id: task_id.to_owned(),
        status,
        provider: None,
        result: None,
        structured: Default::default(),
        suggestions: Vec::new(),
    }
}

#[tokio::test]
async fn followups_thread_accumulated_results_in_order() {
    let (backend, state) = harness();
    login(&backend, &state).await;
    let orchestrator = state.orchestrator();

    backend.script_task(Ok(reply(TaskStatus::Completed, "first result")));
    let first = orchestrator
        .submit(TaskKind::Generic, Provider::Deepseek, "why is the load high")
        .await
        .expect("submit");
    assert_eq!(first.status, TaskStatus::Completed);

    backend.script_task(Ok(reply(TaskStatus::Completed, "second result")));
    let second = orchestrator
        .submit(TaskKind::Generic, Provider::Deepseek, "and the memory")
        .await
        .expect("submit");

    let followup = orchestrator.continue_from(&first);
    let followup_again = orchestrator.continue_from(&second);
    assert_eq!(followup.kind, followup_again.kind);
    assert_eq!(
        orchestrator.context(),
        vec!["first result".to_owned(), "second result".to_owned()]
    );

    backend.script_task(Ok(reply(TaskStatus::Completed, "combined answer")));
    orchestrator
        .submit_followup(&followup, "so what should I do")
        .await
        .expect("followup");

    let request = backend.last_task_request().expect("request");
    assert_eq!(
        request.context,
        Some(TaskContext {
            history: vec!["first result".into(), "second result".into()],
        })
    );
    // A completed response clears the active context.
    assert!(orchestrator.context().is_empty());
}

#[tokio::test]
async fn fresh_submissions_always_clear_the_context_first() {
    let (backend, state) = harness();
    login(&backend, &state).await;
    let orchestrator = state.orchestrator();

    let prior = orchestrator
        .submit(TaskKind::Generic, Provider::Deepseek, "baseline")
        .await
        .expect("submit");
    orchestrator.continue_from(&prior);
    assert!(!orchestrator.context().is_empty());

    orchestrator
        .submit(TaskKind::Generic, Provider::Deepseek, "a fresh question")
        .await
        .expect("submit");

    let request = backend.last_task_request().expect("request");
    assert!(request.context.is_none());
    assert!(orchestrator.context().is_empty());
}

#[tokio::test]
async fn failed_submissions_keep_the_context_and_record_the_failure() {
    let (backend, state) = harness();
    login(&backend, &state).await;
    let orchestrator = state.orchestrator();

    let prior = orchestrator
        .submit(TaskKind::Generic, Provider::Deepseek, "baseline")
        .await
        .expect("submit");
    let followup = orchestrator.continue_from(&prior);
    let saved_context = orchestrator.context();
    assert_eq!(saved_context.len(), 1);

    backend.script_task(Ok(reply(TaskStatus::Failed, "boom")));
    let task = orchestrator
        .submit_followup(&followup, "retry me")
        .await
        .expect("followup");

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.result.as_deref(), Some("boom"));
    assert_eq!(orchestrator.context(), saved_context);
}

#[tokio::test]
async fn transport_failures_mark_the_task_failed() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    backend.script_task(Err(smartops_core::ClientError::Transport(
        "connection refused".into(),
    )));
    let task = state
        .orchestrator()
        .submit(TaskKind::Generic, Provider::Tongyi, "unreachable")
        .await
        .expect("submit");

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .result
        .as_deref()
        .expect("result")
        .contains("connection refused"));
    let listed = state.orchestrator().task(&task.id).expect("listed");
    assert_eq!(listed.status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn polling_observes_a_monotonic_status_path() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    backend.script_status(Ok(snapshot("task_9", TaskStatus::Pending)));
    backend.script_status(Ok(snapshot("task_9", TaskStatus::InProgress)));
    backend.script_status(Ok(snapshot("task_9", TaskStatus::Completed)));

    let (_handle, mut snapshots) = state
        .orchestrator()
        .poll("task_9", true)
        .expect("poll")
        .expect("started");

    let mut observed = Vec::new();
    while let Some(snapshot) = snapshots.recv().await {
        observed.push(snapshot.status);
    }
    assert_eq!(
        observed,
        vec![
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed
        ]
    );
    assert_eq!(backend.status_fetches(), 3);

    // The terminal state sticks on the tracked task.
    let task = state.orchestrator().task("task_9").expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn a_second_poll_for_the_same_id_does_not_start_a_second_timer() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    backend.script_status(Ok(snapshot("task_9", TaskStatus::InProgress)));
    backend.script_status(Ok(snapshot("task_9", TaskStatus::InProgress)));
    backend.script_status(Ok(snapshot("task_9", TaskStatus::Completed)));

    let (_handle, mut snapshots) = state
        .orchestrator()
        .poll("task_9", true)
        .expect("poll")
        .expect("started");

    // Re-entry while the loop is live yields no second timer.
    assert!(state.orchestrator().poll("task_9", true).expect("poll").is_none());

    while snapshots.recv().await.is_some() {}
    // One fetch per scripted interval, not two.
    assert_eq!(backend.status_fetches(), 3);
}

#[tokio::test(start_paused = true)]
async fn a_failed_fetch_terminates_the_poll_as_failed() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    backend.script_status(Ok(snapshot("task_9", TaskStatus::InProgress)));
    // The next fetch falls through to the mock's 404 default.

    let (_handle, mut snapshots) = state
        .orchestrator()
        .poll("task_9", true)
        .expect("poll")
        .expect("started");

    let first = snapshots.recv().await.expect("first");
    assert_eq!(first.status, TaskStatus::InProgress);
    let last = snapshots.recv().await.expect("terminal");
    assert_eq!(last.status, TaskStatus::Failed);
    assert!(last
        .result
        .as_deref()
        .expect("result")
        .contains("status query failed"));
    assert!(snapshots.recv().await.is_none());

    let task = state.orchestrator().task("task_9").expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_fetches_and_freezes_task_state() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    backend.script_status(Ok(snapshot("task_9", TaskStatus::InProgress)));
    backend.script_status(Ok(snapshot("task_9", TaskStatus::InProgress)));
    backend.script_status(Ok(snapshot("task_9", TaskStatus::InProgress)));

    let (handle, mut snapshots) = state
        .orchestrator()
        .poll("task_9", true)
        .expect("poll")
        .expect("started");

    let first = snapshots.recv().await.expect("first");
    assert_eq!(first.status, TaskStatus::InProgress);
    handle.cancel();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.status_fetches(), 1);
    let task = state.orchestrator().task("task_9").expect("task");
    assert_eq!(task.status, TaskStatus::InProgress);
}

#[tokio::test(start_paused = true)]
async fn polling_a_different_id_replaces_the_previous_loop() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    backend.script_status(Ok(snapshot("task_a", TaskStatus::InProgress)));
    backend.script_status(Ok(snapshot("task_b", TaskStatus::Completed)));

    let (_first_handle, mut first_rx) = state
        .orchestrator()
        .poll("task_a", true)
        .expect("poll")
        .expect("started");
    let first = first_rx.recv().await.expect("first snapshot");
    assert_eq!(first.status, TaskStatus::InProgress);

    let (_second_handle, mut second_rx) = state
        .orchestrator()
        .poll("task_b", false)
        .expect("poll")
        .expect("replaced");
    let second = second_rx.recv().await.expect("second snapshot");
    assert_eq!(second.status, TaskStatus::Completed);

    // The first loop was cancelled before its next fetch.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(first_rx.recv().await.is_none());
    assert_eq!(backend.status_fetches(), 2);
}
