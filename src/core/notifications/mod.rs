mod slack;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::JobKind;

/// Events emitted after each pipeline run. Delivery is best-effort; a
/// notification failure never fails the run.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Completed {
        job_id: String,
        kind: JobKind,
        size_bytes: u64,
        duration_secs: u64,
    },
    Failed {
        job_id: String,
        kind: JobKind,
        error: String,
    },
}

/// Trait for notification channel implementations (Slack, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: JobEvent) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &AppConfig) -> Option<Arc<dyn NotificationChannel>> {
    let webhook = config.slack_webhook.as_ref()?;
    if webhook.is_empty() {
        return None;
    }
    Some(Arc::new(slack::SlackNotifier::new(webhook.clone())))
}
