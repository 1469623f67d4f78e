use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use trellis_core::config::{Manifest, ProfileConfig};
use trellis_core::error::{Result, TrellisError};
use trellis_core::types::Scope;

/// Id of the built-in profile behind the `global` context spec.
pub const GLOBAL_PROFILE_ID: &str = "global";

const NONE_SPEC: &str = "none";

/// How candidates are ranked. Only recency exists for now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalPolicy {
    Recency,
}

impl RetrievalPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recency" => Some(Self::Recency),
            _ => None,
        }
    }
}

/// One validated profile source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub scope: Scope,
    /// `None` means no tag restriction.
    pub tags: Option<Vec<String>>,
    pub weight: Option<f64>,
}

impl SourceSpec {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            tags: None,
            weight: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// A validated, named retrieval configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextProfile {
    pub id: String,
    pub max_tokens: usize,
    pub policy: RetrievalPolicy,
    pub sources: Vec<SourceSpec>,
}

impl ContextProfile {
    /// Built-in profile reading only the global tier.
    pub fn builtin_global(max_tokens: usize) -> Self {
        Self {
            id: GLOBAL_PROFILE_ID.to_string(),
            max_tokens,
            policy: RetrievalPolicy::Recency,
            sources: vec![SourceSpec::new(Scope::Global)],
        }
    }

    pub fn reads(&self, scope: Scope) -> bool {
        self.sources.iter().any(|s| s.scope == scope)
    }
}

/// Validate a raw manifest profile. Runs once, at load time.
pub fn validate_profile(raw: &ProfileConfig) -> Result<ContextProfile> {
    if raw.max_tokens <= 0 {
        return Err(TrellisError::InvalidTokenBudget {
            profile: raw.id.clone(),
            max_tokens: raw.max_tokens,
        });
    }

    let policy = RetrievalPolicy::parse(&raw.retrieval).ok_or_else(|| {
        TrellisError::UnsupportedRetrievalPolicy {
            profile: raw.id.clone(),
            policy: raw.retrieval.clone(),
        }
    })?;

    let mut sources = Vec::with_capacity(raw.sources.len());
    for source in &raw.sources {
        let scope = Scope::parse(&source.scope).ok_or_else(|| TrellisError::UnknownScope {
            profile: raw.id.clone(),
            scope: source.scope.clone(),
        })?;
        if let Some(weight) = source.weight {
            if !weight.is_finite() || weight <= 0.0 {
                return Err(TrellisError::InvalidSourceWeight {
                    profile: raw.id.clone(),
                    weight,
                });
            }
        }
        sources.push(SourceSpec {
            scope,
            tags: source.tags.clone(),
            weight: source.weight,
        });
    }

    if sources.is_empty() {
        warn!(profile = %raw.id, "Context profile has no sources, it will always be empty");
    }

    Ok(ContextProfile {
        id: raw.id.clone(),
        max_tokens: raw.max_tokens as usize,
        policy,
        sources,
    })
}

/// A node's context specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSpec {
    None,
    Global,
    Profile(String),
}

impl ContextSpec {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "" | NONE_SPEC => Self::None,
            GLOBAL_PROFILE_ID => Self::Global,
            other => Self::Profile(other.to_string()),
        }
    }
}

impl std::fmt::Display for ContextSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str(NONE_SPEC),
            Self::Global => f.write_str(GLOBAL_PROFILE_ID),
            Self::Profile(id) => f.write_str(id),
        }
    }
}

/// Validated profiles by id, plus the built-in global profile.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<ContextProfile>>,
    global: Arc<ContextProfile>,
}

impl ProfileRegistry {
    pub fn new(global_budget: usize) -> Self {
        Self {
            profiles: HashMap::new(),
            global: Arc::new(ContextProfile::builtin_global(global_budget)),
        }
    }

    /// Validate every profile in the manifest.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        if manifest.engine.default_global_budget == 0 {
            return Err(TrellisError::InvalidTokenBudget {
                profile: GLOBAL_PROFILE_ID.to_string(),
                max_tokens: 0,
            });
        }
        let mut registry = Self::new(manifest.engine.default_global_budget);
        for raw in &manifest.profiles {
            registry.insert(validate_profile(raw)?)?;
        }
        debug!(count = registry.profiles.len(), "Context profiles loaded");
        Ok(registry)
    }

    /// Add an already-validated profile.
    pub fn insert(&mut self, profile: ContextProfile) -> Result<()> {
        if profile.id == GLOBAL_PROFILE_ID || profile.id == NONE_SPEC {
            return Err(TrellisError::Config(format!(
                "profile id '{}' is reserved",
                profile.id
            )));
        }
        if self.profiles.contains_key(&profile.id) {
            return Err(TrellisError::Config(format!(
                "duplicate profile id '{}'",
                profile.id
            )));
        }
        self.profiles.insert(profile.id.clone(), Arc::new(profile));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<ContextProfile>> {
        self.profiles.get(id).cloned()
    }

    pub fn global(&self) -> Arc<ContextProfile> {
        Arc::clone(&self.global)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Resolve a context spec to a profile. `None` means "build an empty package".
pub fn resolve_profile(
    spec: &ContextSpec,
    registry: &ProfileRegistry,
) -> Result<Option<Arc<ContextProfile>>> {
    match spec {
        ContextSpec::None => Ok(None),
        ContextSpec::Global => Ok(Some(registry.global())),
        ContextSpec::Profile(id) => registry
            .get(id)
            .map(Some)
            .ok_or_else(|| TrellisError::UnknownProfile(id.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::config::SourceConfig;

    fn raw(id: &str, max_tokens: i64, retrieval: &str, scopes: &[&str]) -> ProfileConfig {
        ProfileConfig {
            id: id.into(),
            max_tokens,
            retrieval: retrieval.into(),
            sources: scopes
                .iter()
                .map(|s| SourceConfig {
                    scope: s.to_string(),
                    tags: None,
                    weight: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_valid_profile() {
        let p = validate_profile(&raw("p1", 50, "recency", &["task", "project"])).unwrap();
        assert_eq!(p.max_tokens, 50);
        assert_eq!(p.policy, RetrievalPolicy::Recency);
        assert_eq!(p.sources.len(), 2);
        assert!(p.reads(Scope::Project));
        assert!(!p.reads(Scope::Global));
    }

    #[test]
    fn test_rejects_non_positive_budget() {
        for budget in [0, -10] {
            let err = validate_profile(&raw("p", budget, "recency", &["task"])).unwrap_err();
            assert!(matches!(err, TrellisError::InvalidTokenBudget { .. }));
        }
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let err = validate_profile(&raw("p", 10, "semantic", &["task"])).unwrap_err();
        assert!(matches!(
            err,
            TrellisError::UnsupportedRetrievalPolicy { ref policy, .. } if policy == "semantic"
        ));
    }

    #[test]
    fn test_rejects_unknown_scope() {
        let err = validate_profile(&raw("p", 10, "recency", &["task", "session"])).unwrap_err();
        assert!(matches!(
            err,
            TrellisError::UnknownScope { ref scope, .. } if scope == "session"
        ));
    }

    #[test]
    fn test_rejects_bad_weight() {
        let mut p = raw("p", 10, "recency", &["task"]);
        p.sources[0].weight = Some(0.0);
        assert!(matches!(
            validate_profile(&p),
            Err(TrellisError::InvalidSourceWeight { .. })
        ));
    }

    #[test]
    fn test_context_spec_parse() {
        assert_eq!(ContextSpec::parse("none"), ContextSpec::None);
        assert_eq!(ContextSpec::parse(""), ContextSpec::None);
        assert_eq!(ContextSpec::parse("global"), ContextSpec::Global);
        assert_eq!(
            ContextSpec::parse("P1"),
            ContextSpec::Profile("P1".to_string())
        );
    }

    #[test]
    fn test_resolve() {
        let mut registry = ProfileRegistry::new(2_000);
        registry
            .insert(validate_profile(&raw("P1", 50, "recency", &["task"])).unwrap())
            .unwrap();

        assert!(resolve_profile(&ContextSpec::None, &registry)
            .unwrap()
            .is_none());

        let global = resolve_profile(&ContextSpec::Global, &registry)
            .unwrap()
            .unwrap();
        assert_eq!(global.id, GLOBAL_PROFILE_ID);
        assert_eq!(global.max_tokens, 2_000);
        assert_eq!(global.sources, vec![SourceSpec::new(Scope::Global)]);

        let p1 = resolve_profile(&ContextSpec::Profile("P1".into()), &registry)
            .unwrap()
            .unwrap();
        assert_eq!(p1.max_tokens, 50);

        let err = resolve_profile(&ContextSpec::Profile("P9".into()), &registry).unwrap_err();
        assert!(matches!(err, TrellisError::UnknownProfile(ref id) if id == "P9"));
    }

    #[test]
    fn test_registry_rejects_duplicates_and_reserved() {
        let mut registry = ProfileRegistry::new(100);
        let p = validate_profile(&raw("P1", 50, "recency", &["task"])).unwrap();
        registry.insert(p.clone()).unwrap();
        assert!(registry.insert(p).is_err());
        let reserved = validate_profile(&raw("global", 50, "recency", &["task"])).unwrap();
        assert!(registry.insert(reserved).is_err());
    }
}
