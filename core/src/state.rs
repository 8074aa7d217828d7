use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::gateway::{Backend, ChunkReceiver, Gateway};
use crate::history;
use crate::protocol::{ChatMessage, ChatRequest, MessageRole, Provider, TaskKind, TaskStatus};
use crate::session::{ProviderKeys, Session, SessionHandle};
use crate::store::{
    SnapshotStore, ANALYZE_HISTORY_SNAPSHOT, API_KEYS_SNAPSHOT, CHAT_HISTORY_SNAPSHOT,
    SESSION_SNAPSHOT, TASKS_SNAPSHOT,
};
use crate::stream::StreamChunk;
use crate::task::{Task, TaskOrchestrator};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fallback appended to the conversation when a plain chat request fails.
const CHAT_FALLBACK: &str = "The request failed. Check that the backend service is reachable.";
/// Fallback appended when a streamed reply breaks before completing.
const STREAM_FALLBACK: &str =
    "The streamed request failed. Check that the backend service is reachable.";

const ANALYZE_HISTORY_LIMIT: usize = 20;

/// One entry of the file-analysis history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRecord {
    pub filename: String,
    pub result: String,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    messages: Vec<ChatMessage>,
    analyze_history: Vec<AnalyzeRecord>,
    partial_reply: Option<String>,
    streaming: bool,
}

/// The client core: session lifecycle, conversation, streaming and task
/// orchestration behind one handle. UI-framework-agnostic; an outer adapter
/// drives it and observes its state.
#[derive(Clone)]
pub struct ClientState {
    inner: Arc<RwLock<Inner>>,
    session: SessionHandle,
    store: SnapshotStore,
    backend: Arc<dyn Backend>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl ClientState {
    /// Build a state backed by the HTTP gateway, restoring whatever the
    /// snapshot store holds from the previous run.
    pub fn new(config: &ClientConfig, store: SnapshotStore) -> ClientResult<Self> {
        let session = SessionHandle::restore(
            store.load(SESSION_SNAPSHOT).unwrap_or_default(),
            store.load(API_KEYS_SNAPSHOT).unwrap_or_default(),
        );
        let gateway = Gateway::new(config.base_url.clone(), session.clone())?;
        Ok(Self::with_backend(store, session, Arc::new(gateway)))
    }

    /// Build a state over an arbitrary backend (tests, smoke runs).
    pub fn with_backend(
        store: SnapshotStore,
        session: SessionHandle,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let messages = store.load(CHAT_HISTORY_SNAPSHOT).unwrap_or_default();
        let analyze_history = store.load(ANALYZE_HISTORY_SNAPSHOT).unwrap_or_default();
        let tasks = store.load(TASKS_SNAPSHOT).unwrap_or_default();
        let orchestrator = Arc::new(TaskOrchestrator::new(
            backend.clone(),
            session.clone(),
            store.clone(),
            tasks,
        ));
        Self {
            inner: Arc::new(RwLock::new(Inner {
                messages,
                analyze_history,
                partial_reply: None,
                streaming: false,
            })),
            session,
            store,
            backend,
            orchestrator,
        }
    }

    pub fn session(&self) -> Session {
        self.session.snapshot()
    }

    pub fn keys(&self) -> ProviderKeys {
        self.session.keys()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.read().messages.clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.orchestrator.tasks()
    }

    pub fn analyze_history(&self) -> Vec<AnalyzeRecord> {
        self.inner.read().analyze_history.clone()
    }

    /// The in-flight streamed reply, updated after every decoded chunk and
    /// cleared once the stream terminates.
    pub fn partial_reply(&self) -> Option<String> {
        self.inner.read().partial_reply.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.read().streaming
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    /// Authenticate and establish the session. On failure the existing
    /// session state is left untouched.
    pub async fn login(&self, username: &str, password: &str) -> ClientResult<()> {
        let token = self.backend.login(username, password).await?;
        self.establish(username, token).await;
        Ok(())
    }

    pub async fn register(&self, username: &str, password: &str) -> ClientResult<()> {
        let token = self.backend.register(username, password).await?;
        self.establish(username, token).await;
        Ok(())
    }

    async fn establish(&self, username: &str, token: String) {
        self.session.establish(username, token);
        persist(&self.store, SESSION_SNAPSHOT, &self.session.snapshot());
        if let Err(err) = self.refresh_from_server().await {
            tracing::warn!(%err, "post-login refresh failed");
        }
    }

    /// Pull provider keys and task history from the server and replace local
    /// state with the fetched snapshot.
    pub async fn refresh_from_server(&self) -> ClientResult<()> {
        self.session.require_token()?;
        let outcome = history::synchronize(self.backend.as_ref()).await;

        self.session.set_keys(outcome.keys.clone());
        persist(&self.store, API_KEYS_SNAPSHOT, &outcome.keys);

        {
            let mut inner = self.inner.write();
            inner.messages = history::messages_from_records(&outcome.records);
        }
        self.persist_messages();
        self.orchestrator
            .replace_tasks(history::tasks_from_records(&outcome.records));
        Ok(())
    }

    /// Clear token, username and all in-memory conversation/task state.
    /// Further core operations require a fresh login.
    pub fn logout(&self) {
        self.orchestrator.reset();
        self.session.clear();
        {
            let mut inner = self.inner.write();
            inner.messages.clear();
            inner.analyze_history.clear();
            inner.partial_reply = None;
            inner.streaming = false;
        }
        persist(&self.store, SESSION_SNAPSHOT, &Session::default());
        persist(&self.store, API_KEYS_SNAPSHOT, &ProviderKeys::default());
        self.persist_messages();
        persist(
            &self.store,
            ANALYZE_HISTORY_SNAPSHOT,
            &Vec::<AnalyzeRecord>::new(),
        );
    }

    /// Store both provider keys server-side, then adopt them locally.
    pub async fn save_keys(&self, keys: ProviderKeys) -> ClientResult<()> {
        self.session.require_token()?;
        futures::try_join!(
            self.backend.store_key(Provider::Deepseek, &keys.deepseek),
            self.backend.store_key(Provider::Tongyi, &keys.tongyi),
        )?;
        self.session.set_keys(keys.clone());
        persist(&self.store, API_KEYS_SNAPSHOT, &keys);
        Ok(())
    }

    /// One plain chat turn: append the user message, request a reply and
    /// append it. A failure appends a fallback message instead and marks the
    /// bookkeeping task failed; the conversation stays usable.
    pub async fn send_chat(&self, provider: Provider, content: &str) -> ClientResult<String> {
        self.session.require_token()?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(String::new());
        }

        let task = self.orchestrator.record(TaskKind::Chat, provider, content);
        let request = {
            let mut inner = self.inner.write();
            inner.messages.push(ChatMessage::user(content));
            ChatRequest {
                model: provider,
                messages: inner.messages.clone(),
            }
        };
        self.persist_messages();

        match self.backend.chat(&request).await {
            Ok(reply) => {
                self.push_assistant(&reply.reply);
                self.orchestrator
                    .mark(&task.id, TaskStatus::Completed, Some(reply.reply.clone()));
                Ok(reply.reply)
            }
            Err(err) => {
                self.push_assistant(CHAT_FALLBACK);
                self.orchestrator
                    .mark(&task.id, TaskStatus::Failed, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// One streamed chat turn. Chunks are forwarded on the returned channel
    /// while the partial reply grows; on end-of-stream the assembled text is
    /// appended as a single assistant message. Exactly one stream may be in
    /// flight per conversation; overlapping starts are rejected.
    pub async fn send_chat_streaming(
        &self,
        provider: Provider,
        content: &str,
    ) -> ClientResult<ChunkReceiver> {
        self.session.require_token()?;
        let content = content.trim();
        if content.is_empty() {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(Ok(StreamChunk::done()));
            return Ok(rx);
        }

        let request = {
            let mut inner = self.inner.write();
            if inner.streaming {
                return Err(ClientError::StreamBusy);
            }
            inner.streaming = true;
            inner.partial_reply = Some(String::new());
            inner.messages.push(ChatMessage::user(content));
            ChatRequest {
                model: provider,
                messages: inner.messages.clone(),
            }
        };
        self.persist_messages();

        let mut upstream = match self.backend.chat_stream(&request).await {
            Ok(receiver) => receiver,
            Err(err) => {
                self.fail_stream();
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut assembled = String::new();
            while let Some(item) = upstream.recv().await {
                match item {
                    Ok(chunk) if chunk.done => {
                        finish_stream(&inner, &store, ChatMessage::assistant(assembled));
                        let _ = tx.send(Ok(StreamChunk::done()));
                        return;
                    }
                    Ok(chunk) => {
                        assembled.push_str(&chunk.delta);
                        inner.write().partial_reply = Some(assembled.clone());
                        let _ = tx.send(Ok(chunk));
                    }
                    Err(err) => {
                        finish_stream(&inner, &store, ChatMessage::assistant(STREAM_FALLBACK));
                        let _ = tx.send(Err(err));
                        return;
                    }
                }
            }
            // Upstream closed without a done marker: treat as a broken body.
            finish_stream(&inner, &store, ChatMessage::assistant(STREAM_FALLBACK));
            let _ = tx.send(Err(ClientError::StreamUnavailable));
        });

        Ok(rx)
    }

    /// Upload a file for analysis. Successful analyses land in the analysis
    /// history ring; either way the bookkeeping task reaches a terminal
    /// state.
    pub async fn analyze_file(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        provider: Provider,
    ) -> ClientResult<String> {
        self.session.require_token()?;
        let task = self
            .orchestrator
            .record(TaskKind::Analyze, provider, file_name);

        match self.backend.analyze(file_name, contents, provider).await {
            Ok(reply) => {
                let records = {
                    let mut inner = self.inner.write();
                    inner.analyze_history.insert(
                        0,
                        AnalyzeRecord {
                            filename: file_name.to_owned(),
                            result: reply.result.clone(),
                            analyzed_at: Utc::now(),
                        },
                    );
                    inner.analyze_history.truncate(ANALYZE_HISTORY_LIMIT);
                    inner.analyze_history.clone()
                };
                persist(&self.store, ANALYZE_HISTORY_SNAPSHOT, &records);
                self.orchestrator
                    .mark(&task.id, TaskStatus::Completed, Some(reply.result.clone()));
                Ok(reply.result)
            }
            Err(err) => {
                self.orchestrator.mark(
                    &task.id,
                    TaskStatus::Failed,
                    Some(format!("file analysis failed: {err}")),
                );
                Err(err)
            }
        }
    }

    pub fn clear_conversation(&self) {
        self.inner.write().messages.clear();
        self.persist_messages();
    }

    /// Render the conversation as a markdown document. Writing it anywhere
    /// is the adapter's concern.
    pub fn export_markdown(&self) -> String {
        let inner = self.inner.read();
        let mut out = String::from("# SmartOps conversation\n\n");
        for message in &inner.messages {
            let speaker = match message.role {
                MessageRole::User => "Me",
                MessageRole::Assistant => "AI",
            };
            out.push_str(&format!("**{speaker}:** {}\n\n", message.content));
        }
        out
    }

    fn push_assistant(&self, content: &str) {
        self.inner
            .write()
            .messages
            .push(ChatMessage::assistant(content));
        self.persist_messages();
    }

    fn fail_stream(&self) {
        finish_stream(
            &self.inner,
            &self.store,
            ChatMessage::assistant(STREAM_FALLBACK),
        );
    }

    fn persist_messages(&self) {
        let messages = self.inner.read().messages.clone();
        persist(&self.store, CHAT_HISTORY_SNAPSHOT, &messages);
    }
}

/// Terminal stream bookkeeping: append the closing message, clear the
/// partial reply, release the stream guard and persist.
fn finish_stream(inner: &RwLock<Inner>, store: &SnapshotStore, message: ChatMessage) {
    let messages = {
        let mut guard = inner.write();
        guard.messages.push(message);
        guard.partial_reply = None;
        guard.streaming = false;
        guard.messages.clone()
    };
    persist(store, CHAT_HISTORY_SNAPSHOT, &messages);
}

fn persist<T: Serialize>(store: &SnapshotStore, name: &str, value: &T) {
    if let Err(err) = store.save(name, value) {
        tracing::warn!(%err, snapshot = name, "failed to persist snapshot");
    }
}
