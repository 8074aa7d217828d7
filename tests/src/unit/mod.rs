mod orchestrator_tests;
mod session_tests;
mod stream_tests;
mod sync_tests;

use smartops_core::{ClientState, MockBackend, SessionHandle, SnapshotStore};
use std::sync::Arc;

/// A client state over a scripted backend and a throwaway store.
pub(crate) fn harness() -> (Arc<MockBackend>, ClientState) {
    let backend = Arc::new(MockBackend::default());
    let session = SessionHandle::new();
    let state = ClientState::with_backend(SnapshotStore::in_memory(), session, backend.clone());
    (backend, state)
}

/// Log in with a scripted token so authenticated operations can run.
pub(crate) async fn login(backend: &MockBackend, state: &ClientState) {
    backend.script_login(Ok("t1".into()));
    state.login("ops", "x").await.expect("login");
}
