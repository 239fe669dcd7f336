//! Copy-on-write provider/model registry.
//!
//! Reads take a cheap `Arc` snapshot; every mutation clones the current
//! snapshot, applies the change, and publishes the new one atomically.
//! Readers never observe a partially-applied update.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::{GatewayError, Result};
use crate::provider::{Dialect, ModelRecord, ProviderRecord};

/// An immutable view of all registered providers.
#[derive(Debug, Default, Clone)]
pub struct RegistrySnapshot {
    providers: BTreeMap<String, Arc<ProviderRecord>>,
}

impl RegistrySnapshot {
    pub fn provider(&self, id: &str) -> Option<&Arc<ProviderRecord>> {
        self.providers.get(id)
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<ProviderRecord>> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// All dispatchable `(provider, model)` pairs, in deterministic
    /// (provider id, declaration) order. Unloaded local models are
    /// excluded.
    pub fn candidates(&self) -> Vec<(Arc<ProviderRecord>, ModelRecord)> {
        let mut out = Vec::new();
        for provider in self.providers.values() {
            for model in &provider.models {
                if model.loaded {
                    out.push((provider.clone(), model.clone()));
                }
            }
        }
        out
    }
}

/// The shared registry handle.
pub struct Registry {
    inner: RwLock<Arc<RegistrySnapshot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Current snapshot. Cheap; hold it for the duration of one request.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Register a new provider. Fails if the id is taken.
    pub fn register(&self, record: ProviderRecord) -> Result<()> {
        self.mutate(|snap| {
            if snap.providers.contains_key(&record.id) {
                return Err(GatewayError::InvalidRequest {
                    message: format!("provider '{}' is already registered", record.id),
                    details: None,
                });
            }
            snap.providers
                .insert(record.id.clone(), Arc::new(record));
            Ok(())
        })
    }

    /// Replace a provider record, bumping its version.
    pub fn update(&self, mut record: ProviderRecord) -> Result<()> {
        self.mutate(|snap| {
            let Some(existing) = snap.providers.get(&record.id) else {
                return Err(GatewayError::NotFound(format!(
                    "provider '{}'",
                    record.id
                )));
            };
            record.version = existing.version + 1;
            snap.providers
                .insert(record.id.clone(), Arc::new(record));
            Ok(())
        })
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.mutate(|snap| {
            snap.providers
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| GatewayError::NotFound(format!("provider '{id}'")))
        })
    }

    /// Mark a local model loaded or unloaded. Only valid for
    /// `gguf_local` providers; remote models are immutable rows.
    pub fn set_model_loaded(&self, provider_id: &str, model_id: &str, loaded: bool) -> Result<()> {
        self.mutate(|snap| {
            let Some(provider) = snap.providers.get(provider_id) else {
                return Err(GatewayError::NotFound(format!("provider '{provider_id}'")));
            };
            if provider.dialect != Dialect::GgufLocal {
                return Err(GatewayError::InvalidRequest {
                    message: format!(
                        "provider '{provider_id}' is not a local runner; models cannot be loaded or unloaded"
                    ),
                    details: None,
                });
            }
            let mut updated = (**provider).clone();
            let model = updated
                .models
                .iter_mut()
                .find(|m| m.id == model_id)
                .ok_or_else(|| GatewayError::NotFound(format!("model '{model_id}'")))?;
            model.loaded = loaded;
            snap.providers
                .insert(provider_id.to_string(), Arc::new(updated));
            Ok(())
        })
    }

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut RegistrySnapshot) -> Result<()>,
    {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();
        f(&mut next)?;
        *guard = Arc::new(next);
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AuthScheme, Capability};
    use std::collections::BTreeSet;

    fn record(id: &str, dialect: Dialect) -> ProviderRecord {
        ProviderRecord {
            id: id.into(),
            base_url: "http://localhost:8000".into(),
            dialect,
            auth: AuthScheme::None,
            capabilities: BTreeSet::from([Capability::Chat]),
            input_cost_per_m: 0.0,
            output_cost_per_m: 0.0,
            rate_budget_per_min: 60,
            models: vec![ModelRecord {
                id: "m1".into(),
                context_window: 4096,
                capabilities: BTreeSet::new(),
                quality: 0.5,
                loaded: true,
            }],
            region: None,
            compliance_tags: Vec::new(),
            version: 0,
        }
    }

    #[test]
    fn register_and_snapshot() {
        let reg = Registry::new();
        reg.register(record("p1", Dialect::OpenaiChat)).unwrap();

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap.provider("p1").is_some());

        // Duplicate id rejected
        assert!(reg.register(record("p1", Dialect::OpenaiChat)).is_err());
    }

    #[test]
    fn old_snapshots_are_unaffected_by_mutation() {
        let reg = Registry::new();
        reg.register(record("p1", Dialect::OpenaiChat)).unwrap();
        let before = reg.snapshot();

        reg.register(record("p2", Dialect::AnthropicMessages)).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(reg.snapshot().len(), 2);
    }

    #[test]
    fn update_bumps_version() {
        let reg = Registry::new();
        reg.register(record("p1", Dialect::OpenaiChat)).unwrap();
        reg.update(record("p1", Dialect::OpenaiChat)).unwrap();
        assert_eq!(reg.snapshot().provider("p1").unwrap().version, 1);

        assert!(reg.update(record("missing", Dialect::OpenaiChat)).is_err());
    }

    #[test]
    fn model_load_only_for_local_runners() {
        let reg = Registry::new();
        reg.register(record("remote", Dialect::OpenaiChat)).unwrap();
        reg.register(record("local", Dialect::GgufLocal)).unwrap();

        assert!(reg.set_model_loaded("remote", "m1", false).is_err());
        reg.set_model_loaded("local", "m1", false).unwrap();

        let snap = reg.snapshot();
        assert!(!snap.provider("local").unwrap().models[0].loaded);
        // Unloaded models drop out of the candidate list
        let candidates = snap.candidates();
        assert!(candidates.iter().all(|(p, _)| p.id != "local"));
    }

    #[test]
    fn candidates_are_provider_ordered() {
        let reg = Registry::new();
        reg.register(record("beta", Dialect::OpenaiChat)).unwrap();
        reg.register(record("alpha", Dialect::OpenaiChat)).unwrap();
        let ids: Vec<String> = reg
            .snapshot()
            .candidates()
            .iter()
            .map(|(p, _)| p.id.clone())
            .collect();
        assert_eq!(ids, vec!["alpha".to_string(), "beta".to_string()]);
    }
}
