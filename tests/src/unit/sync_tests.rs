use super::{harness, login};
use smartops_core::protocol::HistoryRecord;
use smartops_core::{Backend, ClientError, MessageRole, Provider, TaskStatus};

fn record(task_id: &str, prompt: &str, result: &str) -> HistoryRecord {
    HistoryRecord {
        task_id: task_id.to_owned(),
        status: TaskStatus::Completed,
        provider: Some(Provider::Deepseek),
        prompt: Some(prompt.to_owned()),
        result: Some(result.to_owned()),
        structured: Default::default(),
        suggestions: Vec::new(),
        timestamp: Some("2024-05-01T10:30:00.123456".to_owned()),
    }
}

#[tokio::test]
async fn login_rebuilds_conversation_and_tasks_from_history() {
    let (backend, state) = harness();
    backend.script_history(Ok(vec![
        record("task_1", "first question", "first answer"),
        record("task_2", "second question", "second answer"),
    ]));

    login(&backend, &state).await;

    let messages = state.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "first question");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "first answer");

    let tasks = state.tasks();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, "task_1");
    assert_eq!(tasks[0].status, TaskStatus::Completed);
}

#[tokio::test]
async fn a_failed_history_fetch_degrades_to_empty_history() {
    let (backend, state) = harness();
    backend.script_history(Err(ClientError::Transport("connection reset".into())));

    login(&backend, &state).await;

    assert!(state.session().is_authenticated());
    assert!(state.messages().is_empty());
    assert!(state.tasks().is_empty());
}

#[tokio::test]
async fn refresh_replaces_local_state_instead_of_merging() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    state
        .send_chat(Provider::Deepseek, "local question")
        .await
        .expect("chat");
    assert_eq!(state.messages().len(), 2);
    assert_eq!(state.tasks().len(), 1);

    backend.script_history(Ok(vec![record(
        "task_7",
        "server question",
        "server answer",
    )]));
    state.refresh_from_server().await.expect("refresh");

    let messages = state.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "server question");
    let tasks = state.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "task_7");
}

#[tokio::test]
async fn fetched_provider_keys_are_adopted() {
    let (backend, state) = harness();
    backend
        .store_key(Provider::Deepseek, "dk-123")
        .await
        .expect("seed key");
    backend
        .store_key(Provider::Tongyi, "tk-456")
        .await
        .expect("seed key");

    login(&backend, &state).await;

    let keys = state.keys();
    assert_eq!(keys.deepseek, "dk-123");
    assert_eq!(keys.tongyi, "tk-456");
}

#[tokio::test]
async fn saving_keys_pushes_them_to_the_server_and_adopts_locally() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    state
        .save_keys(smartops_core::ProviderKeys {
            deepseek: "new-dk".into(),
            tongyi: "new-tk".into(),
        })
        .await
        .expect("save keys");

    assert_eq!(state.keys().deepseek, "new-dk");
    assert_eq!(
        backend
            .fetch_key(Provider::Tongyi)
            .await
            .expect("fetch")
            .as_deref(),
        Some("new-tk")
    );
}
