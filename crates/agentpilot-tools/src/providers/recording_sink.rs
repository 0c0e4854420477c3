//! Delivery capability that records what it was asked to send.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ProviderError;
use crate::registry::Capability;
use crate::schema::{OperationSchema, ParamType, ParameterSpec};

/// A single recorded delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub operation_type: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Default)]
struct SinkState {
    deliveries: Mutex<Vec<Delivery>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

/// Capability that records deliveries instead of sending them.
///
/// Clones share state, so a test can keep one handle and register another.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    plugin_key: String,
    operations: Vec<OperationSchema>,
    fail_with: Option<String>,
    delay: Option<Duration>,
    state: Arc<SinkState>,
}

impl RecordingSink {
    pub fn new(plugin_key: impl Into<String>, operations: Vec<OperationSchema>) -> Self {
        let plugin_key = plugin_key.into();
        let operations = operations
            .into_iter()
            .map(|op| OperationSchema {
                plugin_key: plugin_key.clone(),
                ..op
            })
            .collect();
        Self {
            plugin_key,
            operations,
            fail_with: None,
            delay: None,
            state: Arc::new(SinkState::default()),
        }
    }

    /// Email-shaped sink exposing `send_email(to, subject?, body)`.
    pub fn email(plugin_key: impl Into<String>) -> Self {
        Self::new(
            plugin_key,
            vec![OperationSchema::new("", "send_email").with_parameters(vec![
                ParameterSpec::required("to", ParamType::String),
                ParameterSpec::optional("subject", ParamType::String),
                ParameterSpec::required("body", ParamType::Any).content(),
            ])],
        )
    }

    /// Chat-shaped sink exposing `post_message(channel, text)`.
    pub fn chat(plugin_key: impl Into<String>) -> Self {
        Self::new(
            plugin_key,
            vec![OperationSchema::new("", "post_message").with_parameters(vec![
                ParameterSpec::required("channel", ParamType::String),
                ParameterSpec::required("text", ParamType::Any).content(),
            ])],
        )
    }

    /// Make every call fail with the given provider message.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    /// Hold each call for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Deliveries recorded so far, in arrival order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state
            .deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Total number of calls, successful or not.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for RecordingSink {
    fn plugin_key(&self) -> &str {
        &self.plugin_key
    }

    fn operations(&self) -> Vec<OperationSchema> {
        self.operations.clone()
    }

    async fn execute(
        &self,
        operation_type: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match &self.fail_with {
            Some(message) => Err(ProviderError::ExecutionFailed(message.clone())),
            None => {
                self.state
                    .deliveries
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(Delivery {
                        operation_type: operation_type.to_string(),
                        params: params.clone(),
                    });
                Ok(serde_json::json!({
                    "sent": true,
                    "operation": operation_type,
                    "params": params,
                }))
            }
        };

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
