//! Grant ledger for plugin capabilities.
//!
//! A plugin's permission set is never mutated in place. Every decision is
//! appended as a [`GrantEvent`] and the effective set is a fold over the
//! log: for each capability the most recent decision wins. The log can be
//! exported for audit and replayed into a fresh ledger.

use crate::capability::Capability;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use warden_types::{UnixMillis, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Granted,
    Denied,
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantSource {
    /// Declared by the plugin manifest at load time.
    Manifest,
    /// Granted to every plugin by host configuration.
    HostDefault,
    /// Decided by the user through the consent flow.
    Consent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantEvent {
    pub capability: Capability,
    pub decision: Decision,
    pub source: GrantSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: UnixMillis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionLedger {
    events: Vec<GrantEvent>,
}

impl PermissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger whose first events grant `capabilities` from `source`.
    pub fn with_initial(
        capabilities: impl IntoIterator<Item = Capability>,
        source: GrantSource,
    ) -> Self {
        let mut ledger = Self::new();
        for capability in capabilities {
            ledger.grant(capability, source, None);
        }
        ledger
    }

    /// Rebuilds a ledger from an exported event log.
    pub fn replay(events: impl IntoIterator<Item = GrantEvent>) -> Self {
        let mut ledger = Self::new();
        for event in events {
            ledger.record(event);
        }
        ledger
    }

    pub fn record(&mut self, event: GrantEvent) {
        self.events.push(event);
    }

    pub fn grant(&mut self, capability: Capability, source: GrantSource, reason: Option<String>) {
        self.record(GrantEvent {
            capability,
            decision: Decision::Granted,
            source,
            reason,
            at: now_millis(),
        });
    }

    pub fn deny(&mut self, capability: Capability, source: GrantSource, reason: Option<String>) {
        self.record(GrantEvent {
            capability,
            decision: Decision::Denied,
            source,
            reason,
            at: now_millis(),
        });
    }

    /// The latest decision recorded for `capability`, if any.
    pub fn decision(&self, capability: Capability) -> Option<Decision> {
        self.events
            .iter()
            .rev()
            .find(|e| e.capability == capability)
            .map(|e| e.decision)
    }

    pub fn is_granted(&self, capability: Capability) -> bool {
        self.decision(capability) == Some(Decision::Granted)
    }

    pub fn is_denied(&self, capability: Capability) -> bool {
        self.decision(capability) == Some(Decision::Denied)
    }

    /// The effective grant set.
    pub fn granted(&self) -> BTreeSet<Capability> {
        let mut latest = BTreeMap::new();
        for event in &self.events {
            latest.insert(event.capability, event.decision);
        }
        latest
            .into_iter()
            .filter(|(_, d)| *d == Decision::Granted)
            .map(|(c, _)| c)
            .collect()
    }

    pub fn events(&self) -> &[GrantEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_grants() {
        let ledger =
            PermissionLedger::with_initial([Capability::Logger, Capability::Ui], GrantSource::Manifest);
        assert!(ledger.is_granted(Capability::Logger));
        assert!(ledger.is_granted(Capability::Ui));
        assert!(!ledger.is_granted(Capability::Network));
        assert_eq!(ledger.decision(Capability::Network), None);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn latest_decision_wins() {
        let mut ledger = PermissionLedger::new();
        ledger.deny(Capability::Network, GrantSource::Consent, None);
        assert!(ledger.is_denied(Capability::Network));
        ledger.grant(Capability::Network, GrantSource::Consent, Some("sync".into()));
        assert!(ledger.is_granted(Capability::Network));
        assert!(!ledger.is_denied(Capability::Network));
        assert_eq!(ledger.granted(), BTreeSet::from([Capability::Network]));
    }

    #[test]
    fn events_are_append_only() {
        let mut ledger = PermissionLedger::new();
        ledger.grant(Capability::Storage, GrantSource::HostDefault, None);
        ledger.deny(Capability::Chat, GrantSource::Consent, Some("spam".into()));
        ledger.grant(Capability::Chat, GrantSource::Consent, None);
        let sources: Vec<_> = ledger.events().iter().map(|e| e.source).collect();
        assert_eq!(
            sources,
            vec![GrantSource::HostDefault, GrantSource::Consent, GrantSource::Consent]
        );
        assert_eq!(ledger.events()[1].reason.as_deref(), Some("spam"));
    }

    #[test]
    fn replay_reproduces_grant_set() {
        let mut ledger = PermissionLedger::with_initial([Capability::Logger], GrantSource::Manifest);
        ledger.grant(Capability::Network, GrantSource::Consent, None);
        ledger.deny(Capability::Logger, GrantSource::Consent, None);

        let json = serde_json::to_string(ledger.events()).unwrap();
        let events: Vec<GrantEvent> = serde_json::from_str(&json).unwrap();
        let replayed = PermissionLedger::replay(events);
        assert_eq!(replayed.granted(), ledger.granted());
        assert_eq!(replayed.events(), ledger.events());
    }
}
