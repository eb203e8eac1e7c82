use super::{JobEvent, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &JobEvent) -> serde_json::Value {
        match event {
            JobEvent::Completed {
                job_id,
                kind,
                size_bytes,
                duration_secs,
            } => {
                let short_id = &job_id[..8.min(job_id.len())];
                let size_mb = *size_bytes as f64 / (1024.0 * 1024.0);
                json!({
                    "blocks": [
                        {
                            "type": "header",
                            "text": {
                                "type": "plain_text",
                                "text": "Backup Complete",
                                "emoji": true
                            }
                        },
                        {
                            "type": "section",
                            "fields": [
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Job ID:*\n`{}`", short_id)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Trigger:*\n{}", kind.as_str())
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Size:*\n{:.1} MB", size_mb)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Duration:*\n{}s", duration_secs)
                                }
                            ]
                        }
                    ]
                })
            }
            JobEvent::Failed {
                job_id,
                kind,
                error,
            } => {
                let short_id = &job_id[..8.min(job_id.len())];
                json!({
                    "blocks": [
                        {
                            "type": "header",
                            "text": {
                                "type": "plain_text",
                                "text": "Backup Failed",
                                "emoji": true
                            }
                        },
                        {
                            "type": "section",
                            "fields": [
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Job ID:*\n`{}`", short_id)
                                },
                                {
                                    "type": "mrkdwn",
                                    "text": format!("*Trigger:*\n{}", kind.as_str())
                                }
                            ]
                        },
                        {
                            "type": "section",
                            "text": {
                                "type": "mrkdwn",
                                "text": format!("*Error:*\n```{}```", error)
                            }
                        }
                    ]
                })
            }
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let payload = self.format_message(&event);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;
        Ok(())
    }
}
