//! Named, possibly org-scoped templates merged onto an event before
//! validation and sealing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::audit::event::DataClassification;
use crate::error::Result;

/// Default field values and requirements applied to events constructed
/// under this preset's name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresetTemplate {
    pub default_action: Option<String>,
    pub default_data_classification: Option<DataClassification>,
    pub default_retention_policy: Option<String>,
    pub required_fields: Vec<String>,
    pub compliance_profiles: Vec<String>,
}

/// A preset candidate as stored. `organization_id = None` marks a default
/// (platform-wide) preset; `Some(id)` marks an org-specific override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub organization_id: Option<String>,
    pub name: String,
    pub template: PresetTemplate,
}

/// Backing store for preset candidates, pluggable per §9's capability-set
/// guidance. `candidates` returns the org-specific preset first (if any)
/// followed by the default preset (if any) — at most two entries.
#[async_trait]
pub trait PresetStore: Send + Sync {
    async fn candidates(&self, name: &str, organization_id: Option<&str>) -> Result<Vec<Preset>>;
}

/// In-memory preset store. Production deployments back this with a table;
/// this implementation is the one used in tests and as a reference for the
/// on-disk/DB-backed variant.
#[derive(Default)]
pub struct InMemoryPresetStore {
    presets: Mutex<HashMap<(Option<String>, String), Preset>>,
}

impl InMemoryPresetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, preset: Preset) {
        let key = (preset.organization_id.clone(), preset.name.clone());
        self.presets.lock().unwrap().insert(key, preset);
    }
}

#[async_trait]
impl PresetStore for InMemoryPresetStore {
    async fn candidates(&self, name: &str, organization_id: Option<&str>) -> Result<Vec<Preset>> {
        let presets = self.presets.lock().unwrap();
        let mut result = Vec::with_capacity(2);

        if let Some(org_id) = organization_id {
            if let Some(preset) = presets.get(&(Some(org_id.to_string()), name.to_string())) {
                result.push(preset.clone());
            }
        }
        if let Some(preset) = presets.get(&(None, name.to_string())) {
            result.push(preset.clone());
        }

        Ok(result)
    }
}

/// Small capacity-bounded LRU cache. Hand-rolled rather than pulled in as a
/// dependency since the resolver only ever needs get/insert/evict-oldest.
struct BoundedCache<K, V> {
    capacity: usize,
    order: VecDeque<K>,
    entries: HashMap<K, V>,
}

impl<K: Clone + Eq + std::hash::Hash, V: Clone> BoundedCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &K) -> Option<V> {
        if let Some(value) = self.entries.get(key).cloned() {
            self.order.retain(|k| k != key);
            self.order.push_back(key.clone());
            Some(value)
        } else {
            None
        }
    }

    fn put(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }
}

/// Resolves presets by name and organization, merging an org-specific
/// override onto the platform default field-by-field and caching the
/// merged result under `(name, organizationId)`.
pub struct PresetResolver {
    store: std::sync::Arc<dyn PresetStore>,
    cache: Mutex<BoundedCache<(String, Option<String>), Option<Preset>>>,
}

impl PresetResolver {
    pub fn new(store: std::sync::Arc<dyn PresetStore>, cache_capacity: usize) -> Self {
        Self {
            store,
            cache: Mutex::new(BoundedCache::new(cache_capacity)),
        }
    }

    pub async fn resolve(&self, name: &str, organization_id: Option<&str>) -> Result<Option<Preset>> {
        let cache_key = (name.to_string(), organization_id.map(str::to_string));

        if let Some(cached) = self.cache.lock().unwrap().get(&cache_key) {
            return Ok(cached);
        }

        let candidates = self.store.candidates(name, organization_id).await?;
        let merged = merge_candidates(name, candidates);

        self.cache.lock().unwrap().put(cache_key, merged.clone());
        Ok(merged)
    }
}

/// Merges an ordered candidate list (org-specific first) into a single
/// preset, with each field in the org-specific candidate taking precedence
/// over the same field in the default when both are present.
fn merge_candidates(name: &str, candidates: Vec<Preset>) -> Option<Preset> {
    let mut iter = candidates.into_iter();
    let first = iter.next()?;
    let second = iter.next();

    let merged_template = match second {
        Some(default) => PresetTemplate {
            default_action: first.template.default_action.or(default.template.default_action),
            default_data_classification: first
                .template
                .default_data_classification
                .or(default.template.default_data_classification),
            default_retention_policy: first
                .template
                .default_retention_policy
                .or(default.template.default_retention_policy),
            required_fields: if first.template.required_fields.is_empty() {
                default.template.required_fields
            } else {
                first.template.required_fields
            },
            compliance_profiles: merge_unique(
                first.template.compliance_profiles,
                default.template.compliance_profiles,
            ),
        },
        None => first.template,
    };

    Some(Preset {
        organization_id: first.organization_id,
        name: name.to_string(),
        template: merged_template,
    })
}

fn merge_unique(primary: Vec<String>, fallback: Vec<String>) -> Vec<String> {
    let mut merged = primary;
    for item in fallback {
        if !merged.contains(&item) {
            merged.push(item);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_preset() -> Preset {
        Preset {
            organization_id: None,
            name: "login".to_string(),
            template: PresetTemplate {
                default_action: Some("auth.login.attempt".to_string()),
                default_data_classification: Some(DataClassification::Internal),
                default_retention_policy: Some("standard".to_string()),
                required_fields: vec!["principalId".to_string()],
                compliance_profiles: vec![],
            },
        }
    }

    fn org_preset() -> Preset {
        Preset {
            organization_id: Some("org-1".to_string()),
            name: "login".to_string(),
            template: PresetTemplate {
                default_action: None,
                default_data_classification: Some(DataClassification::Confidential),
                default_retention_policy: None,
                required_fields: vec![],
                compliance_profiles: vec!["hipaa".to_string()],
            },
        }
    }

    #[tokio::test]
    async fn org_specific_fields_override_default_field_by_field() {
        let store = std::sync::Arc::new(InMemoryPresetStore::new());
        store.insert(default_preset());
        store.insert(org_preset());

        let resolver = PresetResolver::new(store, 16);
        let resolved = resolver.resolve("login", Some("org-1")).await.unwrap().unwrap();

        assert_eq!(resolved.template.default_data_classification, Some(DataClassification::Confidential));
        assert_eq!(resolved.template.default_action.as_deref(), Some("auth.login.attempt"));
        assert_eq!(resolved.template.required_fields, vec!["principalId".to_string()]);
        assert_eq!(resolved.template.compliance_profiles, vec!["hipaa".to_string()]);
    }

    #[tokio::test]
    async fn falls_back_to_default_when_no_org_override_exists() {
        let store = std::sync::Arc::new(InMemoryPresetStore::new());
        store.insert(default_preset());

        let resolver = PresetResolver::new(store, 16);
        let resolved = resolver.resolve("login", Some("org-2")).await.unwrap().unwrap();
        assert_eq!(resolved.template.default_retention_policy.as_deref(), Some("standard"));
    }

    #[tokio::test]
    async fn unknown_name_resolves_to_none() {
        let store = std::sync::Arc::new(InMemoryPresetStore::new());
        let resolver = PresetResolver::new(store, 16);
        assert!(resolver.resolve("missing", None).await.unwrap().is_none());
    }

    #[test]
    fn bounded_cache_evicts_oldest_entry() {
        let mut cache = BoundedCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
    }
}
