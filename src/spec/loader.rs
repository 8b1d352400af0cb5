//! Specification loading and interning
//!
//! Parses JSON or YAML specification documents, validates every structural
//! invariant, and interns the result by `SpecificationId`. Specifications
//! are never partially loaded: parse and validation failures leave the
//! cache untouched.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{WorkflowError, WorkflowResult};
use crate::spec::types::{Specification, SpecificationId};
use crate::spec::validate::validate;

/// Parse and validate a specification from raw bytes
///
/// The format is sniffed from the first non-whitespace byte: `{` means
/// JSON, anything else is parsed as YAML.
pub fn load(bytes: &[u8]) -> WorkflowResult<Specification> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| WorkflowError::Parse(format!("specification is not UTF-8: {e}")))?;

    let spec: Specification = match text.trim_start().as_bytes().first() {
        Some(b'{') => serde_json::from_str(text)
            .map_err(|e| WorkflowError::Parse(format!("JSON specification: {e}")))?,
        _ => serde_yaml::from_str(text)
            .map_err(|e| WorkflowError::Parse(format!("YAML specification: {e}")))?,
    };

    validate(&spec)?;
    Ok(spec)
}

/// Interned, shared, read-only specifications with LRU eviction
///
/// Instantiable (one per facade); not a process-wide singleton.
pub struct SpecCache {
    specs: Mutex<LruCache<SpecificationId, Arc<Specification>>>,
}

impl SpecCache {
    /// Create a cache bounded to `capacity` specifications
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            specs: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Load, validate and intern a specification document
    pub fn register(&self, bytes: &[u8]) -> WorkflowResult<Arc<Specification>> {
        let spec = Arc::new(load(bytes)?);
        self.specs.lock().put(spec.id.clone(), Arc::clone(&spec));
        tracing::info!(spec_id = %spec.id, "specification registered");
        Ok(spec)
    }

    /// Intern an already validated specification
    pub fn insert(&self, spec: Specification) -> Arc<Specification> {
        let spec = Arc::new(spec);
        self.specs.lock().put(spec.id.clone(), Arc::clone(&spec));
        spec
    }

    /// Resolve a specification, refreshing its recency
    pub fn get(&self, id: &SpecificationId) -> Option<Arc<Specification>> {
        self.specs.lock().get(id).cloned()
    }

    /// Resolve a specification or fail with a structured error
    pub fn resolve(&self, id: &SpecificationId) -> WorkflowResult<Arc<Specification>> {
        self.get(id)
            .ok_or_else(|| WorkflowError::Parse(format!("unknown specification {id}")))
    }

    /// Registered specification ids, most recently used first
    pub fn ids(&self) -> Vec<SpecificationId> {
        self.specs.lock().iter().map(|(id, _)| id.clone()).collect()
    }
}
