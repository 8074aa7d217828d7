//! Outbound request dispatch: the `Backend` seam, the reqwest-backed
//! `Gateway`, and a scripted in-process mock.

use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    AnalyzeReply, AuthRequest, ChatReply, ChatRequest, ConfigUpdate, ConfigValue, ErrorBody,
    HistoryRecord, Provider, TaskReply, TaskRequest, TaskSnapshot, TaskStatus, TokenResponse,
};
use crate::session::{ProviderKeys, SessionHandle};
use crate::stream::{StreamChunk, Utf8Accumulator};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{multipart, Method, Response, StatusCode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use url::Url;
use uuid::Uuid;

/// Receiver half of a streamed reply: decoded fragments ending with a `done`
/// marker, or an error terminating the sequence.
pub type ChunkReceiver = UnboundedReceiver<ClientResult<StreamChunk>>;

/// The seam between the orchestration core and the SmartOps backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> ClientResult<String>;
    async fn register(&self, username: &str, password: &str) -> ClientResult<String>;
    async fn chat(&self, request: &ChatRequest) -> ClientResult<ChatReply>;
    async fn chat_stream(&self, request: &ChatRequest) -> ClientResult<ChunkReceiver>;
    async fn analyze(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        provider: Provider,
    ) -> ClientResult<AnalyzeReply>;
    async fn submit_task(&self, request: &TaskRequest) -> ClientResult<TaskReply>;
    async fn task_status(&self, task_id: &str) -> ClientResult<TaskSnapshot>;
    async fn history(&self) -> ClientResult<Vec<HistoryRecord>>;
    async fn fetch_key(&self, provider: Provider) -> ClientResult<Option<String>>;
    async fn store_key(&self, provider: Provider, api_key: &str) -> ClientResult<()>;
}

/// HTTP gateway to the SmartOps backend.
///
/// Injects `Authorization: Bearer <token>` when the session holds a token
/// and attaches the session-scoped provider key headers. Never retries;
/// transport failures and application error responses surface as distinct
/// error kinds.
pub struct Gateway {
    http: reqwest::Client,
    base_url: Url,
    session: SessionHandle,
}

impl Gateway {
    pub fn new(base_url: Url, session: SessionHandle) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("smartops/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            session,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> ClientResult<reqwest::RequestBuilder> {
        let url = self.base_url.join(path)?;
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.session.token() {
            builder = builder.bearer_auth(token);
        }
        let keys = self.session.keys();
        for provider in [Provider::Deepseek, Provider::Tongyi] {
            let key = keys.get(provider);
            if !key.is_empty() {
                builder = builder.header(provider.key_header(), key);
            }
        }
        Ok(builder)
    }

    async fn decode<T: serde::de::DeserializeOwned>(&self, response: Response) -> ClientResult<T> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|err| ClientError::UnexpectedResponse(format!("{err} in '{body}'")))
        } else {
            Err(application_error(status, &body))
        }
    }

    async fn authenticate(&self, path: &str, username: &str, password: &str) -> ClientResult<String> {
        let request = AuthRequest {
            username: username.to_owned(),
            password: password.to_owned(),
        };
        let response = self.request(Method::POST, path)?.json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            let token: TokenResponse = serde_json::from_str(&body)
                .map_err(|err| ClientError::UnexpectedResponse(format!("{err} in '{body}'")))?;
            Ok(token.access_token)
        } else {
            let detail =
                detail_from_body(&body).unwrap_or_else(|| "authentication failed".to_owned());
            Err(ClientError::AuthFailed(detail))
        }
    }
}

fn detail_from_body(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body).ok().and_then(|b| b.detail)
}

fn application_error(status: StatusCode, body: &str) -> ClientError {
    let detail = detail_from_body(body).unwrap_or_else(|| {
        if body.trim().is_empty() {
            status.to_string()
        } else {
            body.to_owned()
        }
    });
    ClientError::Application {
        status: status.as_u16(),
        detail,
    }
}

#[async_trait]
impl Backend for Gateway {
    async fn login(&self, username: &str, password: &str) -> ClientResult<String> {
        self.authenticate("/api/login", username, password).await
    }

    async fn register(&self, username: &str, password: &str) -> ClientResult<String> {
        self.authenticate("/api/register", username, password).await
    }

    async fn chat(&self, request: &ChatRequest) -> ClientResult<ChatReply> {
        let response = self
            .request(Method::POST, "/chat")?
            .json(request)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn chat_stream(&self, request: &ChatRequest) -> ClientResult<ChunkReceiver> {
        let response = self
            .request(Method::POST, "/chat/stream")?
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(application_error(status, &body));
        }

        let mut body = response.bytes_stream();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut decoder = Utf8Accumulator::default();
            while let Some(item) = body.next().await {
                match item {
                    Ok(bytes) => {
                        let delta = decoder.push(&bytes);
                        if !delta.is_empty()
                            && tx.send(Ok(StreamChunk::delta(delta))).is_err()
                        {
                            return;
                        }
                    }
                    Err(_) => {
                        let _ = tx.send(Err(ClientError::StreamUnavailable));
                        return;
                    }
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                let _ = tx.send(Ok(StreamChunk::delta(tail)));
            }
            let _ = tx.send(Ok(StreamChunk::done()));
        });
        Ok(rx)
    }

    async fn analyze(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        provider: Provider,
    ) -> ClientResult<AnalyzeReply> {
        let part = multipart::Part::bytes(contents).file_name(file_name.to_owned());
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", provider.as_str());
        let response = self
            .request(Method::POST, "/analyze")?
            .multipart(form)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn submit_task(&self, request: &TaskRequest) -> ClientResult<TaskReply> {
        let response = self
            .request(Method::POST, "/api/task")?
            .json(request)
            .send()
            .await?;
        self.decode(response).await
    }

    async fn task_status(&self, task_id: &str) -> ClientResult<TaskSnapshot> {
        let response = self
            .request(Method::GET, "/api/status")?
            .query(&[("task_id", task_id)])
            .send()
            .await?;
        self.decode(response).await
    }

    async fn history(&self) -> ClientResult<Vec<HistoryRecord>> {
        let response = self.request(Method::GET, "/api/history")?.send().await?;
        self.decode(response).await
    }

    async fn fetch_key(&self, provider: Provider) -> ClientResult<Option<String>> {
        let response = self
            .request(Method::GET, "/api/config")?
            .query(&[("model", provider.as_str())])
            .send()
            .await?;
        let value: ConfigValue = self.decode(response).await?;
        Ok(value.value.filter(|v| !v.is_empty()))
    }

    async fn store_key(&self, provider: Provider, api_key: &str) -> ClientResult<()> {
        let update = ConfigUpdate {
            model: provider,
            api_key: api_key.to_owned(),
        };
        let response = self
            .request(Method::POST, "/api/config")?
            .json(&update)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(application_error(status, &body))
        }
    }
}

/// Scripted in-process backend for tests and smoke runs.
///
/// Each endpoint pops its next scripted response, falling back to a
/// serviceable default, and records call counts and the last payloads seen.
#[derive(Default)]
pub struct MockBackend {
    tokens: Mutex<VecDeque<ClientResult<String>>>,
    chat_replies: Mutex<VecDeque<ClientResult<String>>>,
    stream_scripts: Mutex<VecDeque<Vec<ClientResult<String>>>>,
    analyze_replies: Mutex<VecDeque<ClientResult<String>>>,
    task_replies: Mutex<VecDeque<ClientResult<TaskReply>>>,
    status_replies: Mutex<VecDeque<ClientResult<TaskSnapshot>>>,
    history_replies: Mutex<VecDeque<ClientResult<Vec<HistoryRecord>>>>,
    keys: Mutex<ProviderKeys>,
    last_chat_request: Mutex<Option<ChatRequest>>,
    last_task_request: Mutex<Option<TaskRequest>>,
    login_calls: AtomicUsize,
    chat_calls: AtomicUsize,
    task_submissions: AtomicUsize,
    status_fetches: AtomicUsize,
    history_fetches: AtomicUsize,
}

impl MockBackend {
    pub fn script_login(&self, result: ClientResult<String>) {
        self.tokens.lock().push_back(result);
    }

    pub fn script_chat(&self, result: ClientResult<String>) {
        self.chat_replies.lock().push_back(result);
    }

    /// Queue a streamed reply delivered as the given text chunks.
    pub fn script_stream(&self, chunks: &[&str]) {
        let script = chunks.iter().map(|c| Ok((*c).to_owned())).collect();
        self.stream_scripts.lock().push_back(script);
    }

    /// Queue a stream that breaks mid-flight after the given chunks.
    pub fn script_stream_failure(&self, chunks: &[&str]) {
        let mut script: Vec<ClientResult<String>> =
            chunks.iter().map(|c| Ok((*c).to_owned())).collect();
        script.push(Err(ClientError::StreamUnavailable));
        self.stream_scripts.lock().push_back(script);
    }

    pub fn script_analyze(&self, result: ClientResult<String>) {
        self.analyze_replies.lock().push_back(result);
    }

    pub fn script_task(&self, result: ClientResult<TaskReply>) {
        self.task_replies.lock().push_back(result);
    }

    pub fn script_status(&self, result: ClientResult<TaskSnapshot>) {
        self.status_replies.lock().push_back(result);
    }

    pub fn script_history(&self, result: ClientResult<Vec<HistoryRecord>>) {
        self.history_replies.lock().push_back(result);
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn task_submissions(&self) -> usize {
        self.task_submissions.load(Ordering::SeqCst)
    }

    pub fn status_fetches(&self) -> usize {
        self.status_fetches.load(Ordering::SeqCst)
    }

    pub fn history_fetches(&self) -> usize {
        self.history_fetches.load(Ordering::SeqCst)
    }

    pub fn last_chat_request(&self) -> Option<ChatRequest> {
        self.last_chat_request.lock().clone()
    }

    pub fn last_task_request(&self) -> Option<TaskRequest> {
        self.last_task_request.lock().clone()
    }

    fn synthetic_reply(request: &ChatRequest) -> String {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::protocol::MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "How can I help you today?".to_owned());
        format!("[{}] received '{}'", request.model, prompt)
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn login(&self, _username: &str, _password: &str) -> ClientResult<String> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("mock-token-{}", Uuid::new_v4())))
    }

    async fn register(&self, username: &str, password: &str) -> ClientResult<String> {
        self.login(username, password).await
    }

    async fn chat(&self, request: &ChatRequest) -> ClientResult<ChatReply> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_chat_request.lock() = Some(request.clone());
        let reply = self
            .chat_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Self::synthetic_reply(request)))?;
        Ok(ChatReply { reply })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> ClientResult<ChunkReceiver> {
        *self.last_chat_request.lock() = Some(request.clone());
        let script = self
            .stream_scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![Ok(Self::synthetic_reply(request))]);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for entry in script {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                match entry {
                    Ok(delta) => {
                        if tx.send(Ok(StreamChunk::delta(delta))).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                }
            }
            let _ = tx.send(Ok(StreamChunk::done()));
        });
        Ok(rx)
    }

    async fn analyze(
        &self,
        file_name: &str,
        _contents: Vec<u8>,
        provider: Provider,
    ) -> ClientResult<AnalyzeReply> {
        let result = self
            .analyze_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("[{provider}] analysis of '{file_name}'")))?;
        Ok(AnalyzeReply { result })
    }

    async fn submit_task(&self, request: &TaskRequest) -> ClientResult<TaskReply> {
        self.task_submissions.fetch_add(1, Ordering::SeqCst);
        *self.last_task_request.lock() = Some(request.clone());
        self.task_replies.lock().pop_front().unwrap_or_else(|| {
            Ok(TaskReply {
                status: TaskStatus::Completed,
                result: Some(format!("[{}] handled '{}'", request.provider, request.content)),
                structured: Default::default(),
                suggestions: Vec::new(),
            })
        })
    }

    async fn task_status(&self, task_id: &str) -> ClientResult<TaskSnapshot> {
        self.status_fetches.fetch_add(1, Ordering::SeqCst);
        self.status_replies.lock().pop_front().unwrap_or_else(|| {
            Err(ClientError::Application {
                status: 404,
                detail: format!("task '{task_id}' not found"),
            })
        })
    }

    async fn history(&self) -> ClientResult<Vec<HistoryRecord>> {
        self.history_fetches.fetch_add(1, Ordering::SeqCst);
        self.history_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_key(&self, provider: Provider) -> ClientResult<Option<String>> {
        let value = self.keys.lock().get(provider).to_owned();
        Ok(Some(value).filter(|v| !v.is_empty()))
    }

    async fn store_key(&self, provider: Provider, api_key: &str) -> ClientResult<()> {
        self.keys.lock().set(provider, api_key);
        Ok(())
    }
}
