use super::{harness, login};
use smartops_core::store::{API_KEYS_SNAPSHOT, SESSION_SNAPSHOT};
use smartops_core::{
    ClientError, ClientState, MockBackend, Provider, SessionHandle, SnapshotStore, TaskKind,
};
use std::sync::Arc;

#[tokio::test]
async fn login_establishes_the_session_and_fetches_history() {
    let (backend, state) = harness();
    backend.script_login(Ok("t1".into()));

    state.login("ops", "x").await.expect("login");

    let session = state.session();
    assert_eq!(session.token.as_deref(), Some("t1"));
    assert_eq!(session.username.as_deref(), Some("ops"));
    assert_eq!(backend.history_fetches(), 1);
}

#[tokio::test]
async fn failed_login_leaves_the_session_untouched() {
    let (backend, state) = harness();
    backend.script_login(Err(ClientError::AuthFailed("用户名或密码错误".into())));

    let err = state.login("ops", "wrong").await.expect_err("login");
    assert!(matches!(err, ClientError::AuthFailed(_)));

    let session = state.session();
    assert!(session.token.is_none());
    assert!(session.username.is_none());
    assert_eq!(backend.history_fetches(), 0);
}

#[tokio::test]
async fn operations_without_a_token_are_precondition_failures() {
    let (backend, state) = harness();

    let err = state
        .send_chat(Provider::Deepseek, "hello")
        .await
        .expect_err("chat");
    assert!(matches!(err, ClientError::AuthRequired));

    let err = state
        .orchestrator()
        .submit(TaskKind::Generic, Provider::Deepseek, "probe")
        .await
        .expect_err("submit");
    assert!(matches!(err, ClientError::AuthRequired));

    let err = state
        .orchestrator()
        .poll("task_1", false)
        .expect_err("poll");
    assert!(matches!(err, ClientError::AuthRequired));

    // Nothing reached the backend.
    assert_eq!(backend.chat_calls(), 0);
    assert_eq!(backend.task_submissions(), 0);
    assert_eq!(backend.status_fetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn logout_clears_session_conversation_and_tasks() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    state
        .send_chat(Provider::Deepseek, "server load is high")
        .await
        .expect("chat");
    state
        .orchestrator()
        .submit(TaskKind::Generic, Provider::Tongyi, "check the disks")
        .await
        .expect("submit");
    assert!(!state.messages().is_empty());
    assert!(!state.tasks().is_empty());

    state.logout();

    let session = state.session();
    assert!(session.token.is_none());
    assert!(session.username.is_none());
    assert!(state.messages().is_empty());
    assert!(state.tasks().is_empty());
    assert!(state.orchestrator().context().is_empty());

    // Re-authentication is now required.
    let err = state
        .send_chat(Provider::Deepseek, "still there?")
        .await
        .expect_err("chat after logout");
    assert!(matches!(err, ClientError::AuthRequired));
}

#[tokio::test]
async fn snapshots_survive_a_client_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let backend = Arc::new(MockBackend::default());
    {
        let store = SnapshotStore::new(dir.path().to_path_buf());
        let state = ClientState::with_backend(store, SessionHandle::new(), backend.clone());
        backend.script_login(Ok("t1".into()));
        state.login("ops", "x").await?;
        state.send_chat(Provider::Deepseek, "persist me").await?;
    }

    // A fresh client over the same store resumes the session and history.
    let store = SnapshotStore::new(dir.path().to_path_buf());
    let session = SessionHandle::restore(
        store.load(SESSION_SNAPSHOT).unwrap_or_default(),
        store.load(API_KEYS_SNAPSHOT).unwrap_or_default(),
    );
    let state = ClientState::with_backend(store, session, backend);
    assert_eq!(state.session().token.as_deref(), Some("t1"));
    assert_eq!(state.messages().len(), 2);
    assert_eq!(state.tasks().len(), 1);
    Ok(())
}
