use super::{harness, login};
use smartops_core::{ClientError, MessageRole, Provider};

#[tokio::test(start_paused = true)]
async fn chunks_assemble_into_partials_and_one_assistant_message() {
    let (backend, state) = harness();
    login(&backend, &state).await;
    backend.script_stream(&["Hel", "lo"]);

    let mut chunks = state
        .send_chat_streaming(Provider::Deepseek, "greet me")
        .await
        .expect("stream start");

    let first = chunks.recv().await.expect("first").expect("chunk");
    assert_eq!(first.delta, "Hel");
    assert_eq!(state.partial_reply().as_deref(), Some("Hel"));

    let second = chunks.recv().await.expect("second").expect("chunk");
    assert_eq!(second.delta, "lo");
    assert_eq!(state.partial_reply().as_deref(), Some("Hello"));

    let last = chunks.recv().await.expect("terminal").expect("chunk");
    assert!(last.done);
    assert!(chunks.recv().await.is_none());

    // The partial observable is cleared and exactly one assistant message
    // holds the assembled reply.
    assert!(state.partial_reply().is_none());
    assert!(!state.is_streaming());
    let messages = state.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "greet me");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "Hello");
}

#[tokio::test(start_paused = true)]
async fn a_broken_stream_appends_a_fallback_instead_of_a_partial() {
    let (backend, state) = harness();
    login(&backend, &state).await;
    backend.script_stream_failure(&["par"]);

    let mut chunks = state
        .send_chat_streaming(Provider::Deepseek, "diagnose this")
        .await
        .expect("stream start");

    let first = chunks.recv().await.expect("first").expect("chunk");
    assert_eq!(first.delta, "par");

    let err = chunks.recv().await.expect("terminal").expect_err("error");
    assert!(matches!(err, ClientError::StreamUnavailable));

    assert!(state.partial_reply().is_none());
    assert!(!state.is_streaming());
    let messages = state.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert!(messages[1].content.contains("streamed request failed"));
    assert!(!messages[1].content.contains("par"));
}

#[tokio::test(start_paused = true)]
async fn overlapping_stream_starts_are_rejected() {
    let (backend, state) = harness();
    login(&backend, &state).await;
    backend.script_stream(&["one"]);

    let mut first = state
        .send_chat_streaming(Provider::Deepseek, "first question")
        .await
        .expect("stream start");

    let err = state
        .send_chat_streaming(Provider::Deepseek, "second question")
        .await
        .expect_err("second start");
    assert!(matches!(err, ClientError::StreamBusy));

    // Drain the first stream; a new one may then start.
    while first.recv().await.is_some() {}
    assert!(!state.is_streaming());
    backend.script_stream(&["again"]);
    let mut second = state
        .send_chat_streaming(Provider::Deepseek, "third question")
        .await
        .expect("restart");
    while second.recv().await.is_some() {}
    assert_eq!(state.messages().last().expect("message").content, "again");
}

#[tokio::test(start_paused = true)]
async fn empty_input_terminates_immediately_without_messages() {
    let (backend, state) = harness();
    login(&backend, &state).await;

    let mut chunks = state
        .send_chat_streaming(Provider::Deepseek, "   ")
        .await
        .expect("stream start");
    let only = chunks.recv().await.expect("terminal").expect("chunk");
    assert!(only.done);
    assert!(state.messages().is_empty());
    assert!(!state.is_streaming());
}
