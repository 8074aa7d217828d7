//! Reconciles local conversation/task state with server-fetched history.

use crate::gateway::Backend;
use crate::protocol::{ChatMessage, HistoryRecord, Provider, TaskKind};
use crate::session::ProviderKeys;
use crate::task::Task;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

/// What a session-establishment sync produced.
pub struct SyncOutcome {
    pub keys: ProviderKeys,
    pub records: Vec<HistoryRecord>,
}

/// Fetch both provider keys and the task history concurrently. Failures
/// degrade — empty keys, empty history — rather than blocking session use.
pub async fn synchronize(backend: &dyn Backend) -> SyncOutcome {
    let (deepseek, tongyi, history) = futures::join!(
        backend.fetch_key(Provider::Deepseek),
        backend.fetch_key(Provider::Tongyi),
        backend.history(),
    );

    let mut keys = ProviderKeys::default();
    match deepseek {
        Ok(Some(value)) => keys.deepseek = value,
        Ok(None) => {}
        Err(err) => warn!(%err, "deepseek key fetch failed"),
    }
    match tongyi {
        Ok(Some(value)) => keys.tongyi = value,
        Ok(None) => {}
        Err(err) => warn!(%err, "tongyi key fetch failed"),
    }

    let records = match history {
        Ok(records) => records,
        Err(err) => {
            warn!(%err, "history fetch failed; continuing with empty history");
            Vec::new()
        }
    };

    SyncOutcome { keys, records }
}

/// Rebuild the conversation from a history snapshot: each record contributes
/// its prompt as a user message and its result as an assistant message, in
/// delivery order. The snapshot replaces local state, it never merges.
pub fn messages_from_records(records: &[HistoryRecord]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    for record in records {
        if let Some(prompt) = record.prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(ChatMessage::user(prompt));
        }
        if let Some(result) = record.result.as_deref().filter(|r| !r.is_empty()) {
            messages.push(ChatMessage::assistant(result));
        }
    }
    messages
}

/// Rebuild the task list from a history snapshot. Records carry no task
/// kind, so rebuilt entries are `generic`.
pub fn tasks_from_records(records: &[HistoryRecord]) -> Vec<Task> {
    records
        .iter()
        .map(|record| Task {
            id: record.task_id.clone(),
            kind: TaskKind::Generic,
            status: record.status,
            description: record.prompt.clone().unwrap_or_default(),
            provider: record.provider.unwrap_or(Provider::Deepseek),
            created_at: parse_timestamp(record.timestamp.as_deref()),
            result: record.result.clone(),
            structured: record.structured.clone(),
            suggestions: record.suggestions.clone(),
        })
        .collect()
}

/// History timestamps arrive as ISO strings, sometimes without a timezone.
fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|naive| naive.and_utc())
                    .ok()
            })
    })
    .unwrap_or_else(Utc::now)
}
