//! Acting on verdicts: delete, time out, report.

use crate::message::MessageRef;
use crate::verdict::VerdictEvent;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

/// How long a deleted message is remembered for deduplication.
pub const DELETE_MEMORY: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Platform-side moderation actions.
#[async_trait]
pub trait Enforcer: Send + Sync {
    async fn delete_message(&self, message: &MessageRef) -> anyhow::Result<()>;

    async fn timeout_member(&self, message: &MessageRef, until: DateTime<Utc>)
        -> anyhow::Result<()>;

    async fn report(&self, log_channel: &str, event: &VerdictEvent) -> anyhow::Result<()>;
}

/// Deletes the message, times the author out on `mute`, and reports to `log_channel` if any.
///
/// Each step is attempted regardless of the previous one failing.
pub async fn apply_verdict(
    enforcer: &dyn Enforcer,
    event: &VerdictEvent,
    log_channel: Option<&str>,
    timeout: Duration,
) {
    if !event.verdict.matched() {
        return;
    }
    let message = &event.message;
    if let Err(err) = enforcer.delete_message(message).await {
        log::warn!("Failed to delete message {}: {err:#}", message.message_id);
    }
    if event.verdict.mute() {
        match Utc::now().checked_add_signed(timeout) {
            Some(until) => {
                if let Err(err) = enforcer.timeout_member(message, until).await {
                    log::warn!("Failed to time out {}: {err:#}", message.author_id);
                }
            }
            None => log::warn!(
                "Timeout of {} days for {} is out of range, not timing out",
                timeout.num_days(),
                message.author_id
            ),
        }
    }
    if let Some(channel) = log_channel {
        if let Err(err) = enforcer.report(channel, event).await {
            log::warn!("Failed to report to {channel}: {err:#}");
        }
    }
}

type DeleteKey = (String, String);

/// Keys seen within `ttl`, expired oldest first.
#[derive(Debug)]
struct RecentKeys {
    ttl: std::time::Duration,
    order: VecDeque<(Instant, DeleteKey)>,
    seen: HashMap<DeleteKey, Instant>,
}

impl RecentKeys {
    fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl,
            order: VecDeque::new(),
            seen: HashMap::new(),
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, _)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            if let Some((at, key)) = self.order.pop_front() {
                // A key forgotten and marked again has a newer entry further back.
                if self.seen.get(&key) == Some(&at) {
                    self.seen.remove(&key);
                }
            }
        }
    }

    fn insert(&mut self, key: DeleteKey, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key.clone(), now);
        self.order.push_back((now, key));
        true
    }

    fn remove(&mut self, key: &DeleteKey) {
        self.seen.remove(key);
    }
}

/// Makes repeated deletes of one message and repeated timeouts of a muted user no-ops.
///
/// Deletes are remembered for [`DELETE_MEMORY`], mutes until they expire.
pub struct DedupEnforcer<E> {
    inner: E,
    deleted: Mutex<RecentKeys>,
    muted: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl<E: Enforcer> DedupEnforcer<E> {
    pub fn new(inner: E) -> Self {
        Self::with_delete_memory(inner, DELETE_MEMORY)
    }

    pub fn with_delete_memory(inner: E, memory: std::time::Duration) -> Self {
        Self {
            inner,
            deleted: Mutex::new(RecentKeys::new(memory)),
            muted: Mutex::new(HashMap::new()),
        }
    }

    /// Deleted messages currently remembered.
    #[must_use]
    pub fn remembered_deletes(&self) -> usize {
        self.deleted.lock().map(|g| g.seen.len()).unwrap_or_default()
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    fn mute_key(message: &MessageRef) -> String {
        format!(
            "{}/{}",
            message.community_id.as_deref().unwrap_or_default(),
            message.author_id
        )
    }

    /// Marks `key` and returns whether it was new. Unmarked again by `forget_*` on failure.
    fn mark_deleted(&self, key: DeleteKey, now: Instant) -> bool {
        let mut guard = match self.deleted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(key, now)
    }

    fn forget_deleted(&self, key: &DeleteKey) {
        if let Ok(mut guard) = self.deleted.lock() {
            guard.remove(key);
        }
    }

    fn mark_muted(&self, key: &str, until: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let mut guard = match self.muted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.retain(|_, expires| *expires > now);
        if guard.contains_key(key) {
            return false;
        }
        guard.insert(key.to_string(), until);
        true
    }

    fn forget_muted(&self, key: &str) {
        if let Ok(mut guard) = self.muted.lock() {
            guard.remove(key);
        }
    }
}

#[async_trait]
impl<E: Enforcer> Enforcer for DedupEnforcer<E> {
    async fn delete_message(&self, message: &MessageRef) -> anyhow::Result<()> {
        let key = (message.channel_id.clone(), message.message_id.clone());
        if !self.mark_deleted(key.clone(), Instant::now()) {
            log::debug!("Message {} already deleted", message.message_id);
            return Ok(());
        }
        let result = self.inner.delete_message(message).await;
        if result.is_err() {
            self.forget_deleted(&key);
        }
        result
    }

    async fn timeout_member(
        &self,
        message: &MessageRef,
        until: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let key = Self::mute_key(message);
        if !self.mark_muted(&key, until, Utc::now()) {
            log::debug!("{} is already timed out", message.author_id);
            return Ok(());
        }
        let result = self.inner.timeout_member(message, until).await;
        if result.is_err() {
            self.forget_muted(&key);
        }
        result
    }

    async fn report(&self, log_channel: &str, event: &VerdictEvent) -> anyhow::Result<()> {
        self.inner.report(log_channel, event).await
    }
}

/// Writes actions to the log; for dry runs and the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEnforcer;

#[async_trait]
impl Enforcer for LogEnforcer {
    async fn delete_message(&self, message: &MessageRef) -> anyhow::Result<()> {
        log::info!(
            "delete message {} in channel {}",
            message.message_id,
            message.channel_id
        );
        Ok(())
    }

    async fn timeout_member(
        &self,
        message: &MessageRef,
        until: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        log::info!(
            "time out {} until {}",
            message.author_id,
            until.to_rfc3339()
        );
        Ok(())
    }

    async fn report(&self, log_channel: &str, event: &VerdictEvent) -> anyhow::Result<()> {
        log::info!(
            "report to {log_channel}: {} by {} ({}){}",
            event.verdict.category().map(|c| c.title()).unwrap_or("clean"),
            event.message.author_id,
            event.verdict.detail().replace('\n', " "),
            if event.verdict.evidence().is_some() {
                " [evidence.jpg]"
            } else {
                ""
            }
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementAction {
    Delete { message_id: String },
    Timeout { user_id: String },
    Report { channel: String, message_id: String },
}

/// Keeps every action in memory.
#[derive(Debug, Default)]
pub struct RecordingEnforcer {
    actions: Mutex<Vec<EnforcementAction>>,
}

impl RecordingEnforcer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn actions(&self) -> Vec<EnforcementAction> {
        self.actions.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn push(&self, action: EnforcementAction) {
        let mut guard = match self.actions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(action);
    }
}

#[async_trait]
impl Enforcer for RecordingEnforcer {
    async fn delete_message(&self, message: &MessageRef) -> anyhow::Result<()> {
        self.push(EnforcementAction::Delete {
            message_id: message.message_id.clone(),
        });
        Ok(())
    }

    async fn timeout_member(
        &self,
        message: &MessageRef,
        _until: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.push(EnforcementAction::Timeout {
            user_id: message.author_id.clone(),
        });
        Ok(())
    }

    async fn report(&self, log_channel: &str, event: &VerdictEvent) -> anyhow::Result<()> {
        self.push(EnforcementAction::Report {
            channel: log_channel.to_string(),
            message_id: event.message.message_id.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl<T: Enforcer + ?Sized> Enforcer for std::sync::Arc<T> {
    async fn delete_message(&self, message: &MessageRef) -> anyhow::Result<()> {
        (**self).delete_message(message).await
    }

    async fn timeout_member(
        &self,
        message: &MessageRef,
        until: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        (**self).timeout_member(message, until).await
    }

    async fn report(&self, log_channel: &str, event: &VerdictEvent) -> anyhow::Result<()> {
        (**self).report(log_channel, event).await
    }
}
