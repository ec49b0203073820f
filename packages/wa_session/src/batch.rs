//! Paced bulk sends through one session.

use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::event_log::{EventLog, EventRecord, SendSource};
use crate::phone::normalize_mobile;
use crate::session::{OutboundRequest, SessionHandle};

/// One entry of a batch: either literal text or a named template rendered
/// with the remaining fields of the item.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchItem {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(flatten)]
    pub vars: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemResult {
    pub to: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub ok: bool,
    pub total: usize,
    pub results: Vec<BatchItemResult>,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Pause between consecutive items.
    pub rate: Duration,
    pub default_text: String,
    pub templates: HashMap<String, String>,
    /// When set, national numbers get this country code prepended.
    pub default_country_code: Option<String>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            rate: Duration::from_millis(800),
            default_text: "Mensaje de prueba".to_string(),
            templates: HashMap::new(),
            default_country_code: None,
        }
    }
}

pub struct BatchSender {
    settings: BatchSettings,
    log: Arc<EventLog>,
    env: Environment<'static>,
}

impl BatchSender {
    pub fn new(settings: BatchSettings, log: Arc<EventLog>) -> Self {
        Self {
            settings,
            log,
            env: Environment::new(),
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Send every item in order, one at a time.
    ///
    /// A failing item is recorded in its result and the log; it never stops
    /// the rest of the batch. The session must be connected when the batch
    /// starts.
    pub async fn send(
        &self,
        session: &SessionHandle,
        items: Vec<BatchItem>,
    ) -> Result<BatchReport, SessionError> {
        if !session.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let total = items.len();
        info!("Sending batch of {} to '{}'", total, session.agent());

        let mut results = Vec::with_capacity(total);
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 && !self.settings.rate.is_zero() {
                tokio::time::sleep(self.settings.rate).await;
            }
            results.push(self.send_one(session, item).await);
        }

        Ok(BatchReport {
            ok: true,
            total,
            results,
        })
    }

    async fn send_one(&self, session: &SessionHandle, item: BatchItem) -> BatchItemResult {
        let request = match self.prepare(&item) {
            Ok(request) => request,
            Err(error) => {
                self.log
                    .append(
                        &EventRecord::send_failed(
                            session.agent(),
                            item.to.as_deref(),
                            item.text.as_deref(),
                            SendSource::Batch,
                            error.clone(),
                        )
                        .with_template(item.template.clone()),
                    )
                    .await;
                return BatchItemResult {
                    to: item.to,
                    ok: false,
                    error: Some(error),
                };
            }
        };

        match session.send(request.clone()).await {
            Ok(_) => BatchItemResult {
                to: item.to,
                ok: true,
                error: None,
            },
            Err(e) => {
                warn!("Batch item to {:?} failed: {}", item.to, e);
                // The session logs failures it saw; these never reached it.
                if matches!(e, SessionError::NotConnected | SessionError::ActorGone) {
                    self.log
                        .append(
                            &EventRecord::send_failed(
                                session.agent(),
                                Some(&request.to),
                                Some(&request.text),
                                SendSource::Batch,
                                e.to_string(),
                            )
                            .with_template(request.template),
                        )
                        .await;
                }
                BatchItemResult {
                    to: item.to,
                    ok: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn prepare(&self, item: &BatchItem) -> Result<OutboundRequest, String> {
        let to = item
            .to
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "missing 'to'".to_string())?;
        let to = match &self.settings.default_country_code {
            Some(cc) => normalize_mobile(to, cc).unwrap_or_else(|| to.to_string()),
            None => to.to_string(),
        };

        let text = match &item.template {
            Some(name) => self.render(name, item)?,
            None => item
                .text
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| self.settings.default_text.clone()),
        };

        Ok(OutboundRequest {
            to,
            text,
            template: item.template.clone(),
            source: SendSource::Batch,
        })
    }

    fn render(&self, name: &str, item: &BatchItem) -> Result<String, String> {
        let source = self
            .settings
            .templates
            .get(name)
            .ok_or_else(|| format!("unknown template '{}'", name))?;
        let mut ctx = item.vars.clone();
        if let Some(to) = &item.to {
            ctx.insert("to".into(), Value::String(to.clone()));
        }
        if let Some(text) = &item.text {
            ctx.insert("text".into(), Value::String(text.clone()));
        }
        self.env
            .render_str(source, Value::Object(ctx))
            .map_err(|e| format!("template '{}' failed: {}", name, e))
    }
}
