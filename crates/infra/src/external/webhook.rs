//! Downstream consumer client: `POST {base}/notify`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::CallbackConfig;
use crate::jobs::callback::{CallbackSink, DeliveryError};
use crate::jobs::types::NotifyPayload;

use super::join_url;

#[derive(Debug, Clone)]
pub struct HttpCallbackSink {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpCallbackSink {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: join_url(base_url, "notify"),
            timeout,
        }
    }

    /// `None` when no consumer URL is configured.
    pub fn from_config(config: &CallbackConfig) -> Option<Self> {
        config
            .url
            .as_deref()
            .map(|url| Self::new(url, config.timeout))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CallbackSink for HttpCallbackSink {
    async fn notify(&self, payload: &NotifyPayload) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }
        debug!(endpoint = %self.endpoint, records = payload.records.len(), "consumer accepted notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_notify() {
        let sink = HttpCallbackSink::new("http://consumer:9000/", Duration::from_secs(1));
        assert_eq!(sink.endpoint(), "http://consumer:9000/notify");
    }

    #[test]
    fn unconfigured_consumer_has_no_sink() {
        assert!(HttpCallbackSink::from_config(&CallbackConfig::default()).is_none());
    }
}
