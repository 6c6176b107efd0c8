use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::{required, PushoverConfig};
use crate::error::{ConfigError, NotifyError};
use crate::notify::{Notification, NotificationChannel};

// Keep rejected response bodies short in logs.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct PushoverMessage<'a> {
    token: &'a str,
    user: &'a str,
    message: String,
}

/// Delivers notifications as push messages through the Pushover API.
pub struct PushoverChannel {
    token: String,
    user: String,
    api_url: String,
    http_client: Client,
}

impl PushoverChannel {
    /// Returns `Ok(None)` when neither the token nor the user key is set.
    pub fn from_config(
        config: &PushoverConfig,
        request_timeout: Duration,
    ) -> Result<Option<Self>, ConfigError> {
        if config.is_unset() {
            return Ok(None);
        }

        let token = required(&config.pushover_token, "PUSHOVER_TOKEN")?;
        let user = required(&config.pushover_user, "PUSHOVER_USER")?;
        let api_url = reqwest::Url::parse(&config.pushover_api_url).map_err(|e| {
            ConfigError::Invalid {
                key: "PUSHOVER_API_URL",
                reason: e.to_string(),
            }
        })?;

        let http_client = Client::builder()
            .user_agent("stethoscope")
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "PUSHOVER_API_URL",
                reason: e.to_string(),
            })?;

        Ok(Some(Self {
            token: token.to_owned(),
            user: user.to_owned(),
            api_url: api_url.to_string(),
            http_client,
        }))
    }
}

#[async_trait]
impl NotificationChannel for PushoverChannel {
    fn name(&self) -> &str {
        "pushover"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .http_client
            .post(&self.api_url)
            .form(&PushoverMessage {
                token: &self.token,
                user: &self.user,
                message: notification.message(),
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(NotifyError::Rejected { status, body })
    }
}
