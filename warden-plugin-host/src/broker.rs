//! Permission broker: drives user consent for ungranted capabilities.
//!
//! A call to an ungranted capability is suspended while the consent
//! provider decides. Only that call waits; other calls proceed. Concurrent
//! requests for the same plugin and capability share one prompt.

use crate::capability::Capability;
use crate::message::{ErrorCode, ErrorPayload, Message, MessageType};
use crate::permissions::{GrantSource, PermissionLedger};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use warden_types::{CorrelationId, PluginId, now_millis};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: CorrelationId,
    pub plugin_id: PluginId,
    pub capability: Capability,
    /// Justification supplied at the plugin call site.
    pub reason: String,
}

impl PermissionRequest {
    /// The `permission-request` message raised to the consent flow.
    pub fn message(&self) -> Message {
        Message {
            id: self.id,
            kind: MessageType::PermissionRequest,
            payload: json!({
                "pluginId": self.plugin_id,
                "capability": self.capability,
                "reason": self.reason,
            }),
            timestamp: now_millis(),
        }
    }
}

/// Returns the user's decision for a permission request.
///
/// An `Err` is treated as a denial.
#[async_trait]
pub trait ConsentProvider: Send + Sync {
    async fn decide(&self, request: &PermissionRequest) -> anyhow::Result<bool>;
}

/// Answers every request the same way.
#[derive(Debug, Clone, Copy)]
pub struct StaticConsent {
    grant: bool,
}

impl StaticConsent {
    pub fn grant_all() -> Self {
        Self { grant: true }
    }

    pub fn deny_all() -> Self {
        Self { grant: false }
    }
}

#[async_trait]
impl ConsentProvider for StaticConsent {
    async fn decide(&self, _request: &PermissionRequest) -> anyhow::Result<bool> {
        Ok(self.grant)
    }
}

/// A pending consent decision handed to the UI side of a [`ChannelConsent`].
#[derive(Debug)]
pub struct ConsentPrompt {
    pub request: PermissionRequest,
    reply: oneshot::Sender<Value>,
}

impl ConsentPrompt {
    /// Answers the prompt. Anything but a JSON boolean is a denial.
    pub fn respond(self, decision: Value) {
        let _ = self.reply.send(decision);
    }

    pub fn grant(self) {
        self.respond(Value::Bool(true));
    }

    pub fn deny(self) {
        self.respond(Value::Bool(false));
    }
}

/// Forwards requests over a channel to whoever renders the dialog.
#[derive(Debug, Clone)]
pub struct ChannelConsent {
    prompts: mpsc::Sender<ConsentPrompt>,
}

impl ChannelConsent {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ConsentPrompt>) {
        let (prompts, rx) = mpsc::channel(buffer);
        (Self { prompts }, rx)
    }
}

#[async_trait]
impl ConsentProvider for ChannelConsent {
    async fn decide(&self, request: &PermissionRequest) -> anyhow::Result<bool> {
        let (reply, decision) = oneshot::channel();
        self.prompts
            .send(ConsentPrompt {
                request: request.clone(),
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("consent UI is gone"))?;
        match decision.await? {
            Value::Bool(granted) => Ok(granted),
            other => {
                debug!(decision = %other, "Non-boolean consent decision treated as deny");
                Ok(false)
            }
        }
    }
}

type PromptKey = (PluginId, Capability);

pub struct PermissionBroker {
    consent: Arc<dyn ConsentProvider>,
    remember_denials: bool,
    prompts: Mutex<HashMap<PromptKey, watch::Receiver<Option<bool>>>>,
    prompts_issued: AtomicUsize,
}

enum Role {
    Leader(watch::Sender<Option<bool>>),
    Follower(watch::Receiver<Option<bool>>),
    AlreadyDecided(bool),
}

/// Removes the in-flight prompt entry even if the leader is cancelled.
struct PromptGuard<'a> {
    broker: &'a PermissionBroker,
    key: PromptKey,
}

impl Drop for PromptGuard<'_> {
    fn drop(&mut self) {
        self.broker.lock_prompts().remove(&self.key);
    }
}

fn lock_ledger(ledger: &Mutex<PermissionLedger>) -> MutexGuard<'_, PermissionLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PermissionBroker {
    pub fn new(consent: Arc<dyn ConsentProvider>, remember_denials: bool) -> Self {
        Self {
            consent,
            remember_denials,
            prompts: Mutex::new(HashMap::new()),
            prompts_issued: AtomicUsize::new(0),
        }
    }

    fn lock_prompts(&self) -> MutexGuard<'_, HashMap<PromptKey, watch::Receiver<Option<bool>>>> {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of times the consent provider has been asked.
    pub fn prompts_issued(&self) -> usize {
        self.prompts_issued.load(Ordering::Relaxed)
    }

    /// Succeeds once `plugin_id` holds `capability`, prompting if it does not.
    ///
    /// A grant is appended to `ledger` and lasts for the plugin's lifetime.
    /// A denial is appended too, but only blocks later prompts when the
    /// broker remembers denials.
    pub async fn authorize(
        &self,
        plugin_id: &PluginId,
        ledger: &Mutex<PermissionLedger>,
        capability: Capability,
        reason: Option<&str>,
    ) -> Result<(), ErrorPayload> {
        {
            let ledger = lock_ledger(ledger);
            if ledger.is_granted(capability) {
                return Ok(());
            }
            if self.remember_denials && ledger.is_denied(capability) {
                debug!(plugin_id = %plugin_id, %capability, "Denial remembered, not prompting");
                return Err(denied(plugin_id, capability, reason, true));
            }
        }

        if self.prompt(plugin_id, ledger, capability, reason).await {
            Ok(())
        } else {
            Err(denied(plugin_id, capability, reason, false))
        }
    }

    async fn prompt(
        &self,
        plugin_id: &PluginId,
        ledger: &Mutex<PermissionLedger>,
        capability: Capability,
        reason: Option<&str>,
    ) -> bool {
        let key = (plugin_id.clone(), capability);
        let role = {
            let mut prompts = self.lock_prompts();
            match prompts.get(&key) {
                Some(rx) => Role::Follower(rx.clone()),
                // A prompt may have finished between the caller's ledger check
                // and taking this lock.
                None if lock_ledger(ledger).is_granted(capability) => Role::AlreadyDecided(true),
                None => {
                    let (tx, rx) = watch::channel(None);
                    prompts.insert(key.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        let tx = match role {
            Role::AlreadyDecided(granted) => return granted,
            Role::Follower(mut rx) => {
                debug!(plugin_id = %plugin_id, %capability, "Joining in-flight permission prompt");
                return rx
                    .wait_for(Option::is_some)
                    .await
                    .map(|decision| *decision == Some(true))
                    .unwrap_or(false);
            }
            Role::Leader(tx) => tx,
        };

        let _guard = PromptGuard { broker: self, key };
        self.prompts_issued.fetch_add(1, Ordering::Relaxed);
        let request = PermissionRequest {
            id: CorrelationId::new(),
            plugin_id: plugin_id.clone(),
            capability,
            reason: reason.unwrap_or_default().to_string(),
        };
        info!(
            plugin_id = %plugin_id,
            %capability,
            correlation_id = %request.id,
            reason = %request.reason,
            "Requesting permission"
        );

        let granted = match self.consent.decide(&request).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!(plugin_id = %plugin_id, %capability, error = %e, "Consent provider failed, treating as deny");
                false
            }
        };

        {
            let mut ledger = lock_ledger(ledger);
            let reason = reason.map(str::to_string);
            if granted {
                ledger.grant(capability, GrantSource::Consent, reason);
            } else {
                ledger.deny(capability, GrantSource::Consent, reason);
            }
        }
        info!(plugin_id = %plugin_id, %capability, granted, "Permission decided");

        let _ = tx.send(Some(granted));
        granted
    }
}

fn denied(
    plugin_id: &PluginId,
    capability: Capability,
    reason: Option<&str>,
    remembered: bool,
) -> ErrorPayload {
    ErrorPayload::new(
        ErrorCode::PermissionDenied,
        format!("plugin '{plugin_id}' was denied the '{capability}' capability"),
    )
    .with_detail(json!({
        "capability": capability,
        "reason": reason,
        "remembered": remembered,
    }))
}
