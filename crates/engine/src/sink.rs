use crate::enforcement::{apply_verdict, Enforcer};
use crate::state::CommunityStore;
use crate::verdict::VerdictEvent;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where matched verdicts go: the enforcer first, then the optional subscriber channel.
#[derive(Clone)]
pub(crate) struct VerdictSink {
    enforcer: Arc<dyn Enforcer>,
    communities: Arc<CommunityStore>,
    timeout: Duration,
    subscriber: Option<mpsc::Sender<VerdictEvent>>,
}

impl VerdictSink {
    pub(crate) fn new(
        enforcer: Arc<dyn Enforcer>,
        communities: Arc<CommunityStore>,
        timeout: Duration,
        subscriber: Option<mpsc::Sender<VerdictEvent>>,
    ) -> Self {
        Self {
            enforcer,
            communities,
            timeout,
            subscriber,
        }
    }

    pub(crate) async fn emit(&self, event: VerdictEvent) {
        let log_channel = event
            .message
            .community_id
            .as_deref()
            .and_then(|id| self.communities.log_channel(id));
        log::info!(
            "{} in message {} by {}: {}",
            event
                .verdict
                .category()
                .map(|c| c.title())
                .unwrap_or("clean"),
            event.message.message_id,
            event.message.author_id,
            event.verdict.detail().replace('\n', " ")
        );
        apply_verdict(
            self.enforcer.as_ref(),
            &event,
            log_channel.as_deref(),
            self.timeout,
        )
        .await;
        if let Some(tx) = &self.subscriber {
            if tx.send(event).await.is_err() {
                log::debug!("Verdict subscriber is gone");
            }
        }
    }
}
