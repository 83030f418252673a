//! Versioned contract schemas + compiled-validator cache for payload validation.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jsonschema::error::ValidationErrorKind;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "sasp-contracts";

/// Contracts pinned to `v1` by the convenience validators.
pub const USER_STATS: &str = "user_stats";
pub const ATTEMPTS_LIST: &str = "attempts_list";
pub const ATTEMPT_DETAIL: &str = "attempt_detail";

/// Rule category behind a validation failure. Taken from the validator's
/// native error kind where possible; `Other` means the kind had no clean
/// mapping and keyword inference from the message also failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Type,
    Required,
    Range,
    Pattern,
    Format,
    Other,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleKind::Type => "type",
            RuleKind::Required => "required",
            RuleKind::Range => "range",
            RuleKind::Pattern => "pattern",
            RuleKind::Format => "format",
            RuleKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// One offending field in a failed validation.
#[derive(Debug, Clone)]
pub struct FieldError {
    pub path: String,
    pub message: String,
    pub rule: RuleKind,
    pub value: Option<Value>,
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("{}", summarize(.contract, .errors))]
    Validation {
        contract: String,
        errors: Vec<FieldError>,
    },
    #[error("contract directory not found: {0}")]
    ContractNotFound(String),
    #[error("schema not found: {contract}:{version}")]
    SchemaNotFound { contract: String, version: String },
    #[error("invalid schema for {contract}: {message}")]
    InvalidSchema { contract: String, message: String },
    #[error("reading schema {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// First 5 errors with paths and rules, plus an overflow count.
fn summarize(contract: &str, errors: &[FieldError]) -> String {
    if errors.is_empty() {
        return format!("contract '{contract}' validation failed");
    }
    let mut lines = vec![format!("contract '{contract}' validation failed:")];
    for (i, error) in errors.iter().take(5).enumerate() {
        lines.push(format!(
            "  {}. [{}] {} (rule: {})",
            i + 1,
            error.path,
            error.message,
            error.rule
        ));
    }
    if errors.len() > 5 {
        lines.push(format!("  ... and {} more error(s)", errors.len() - 5));
    }
    lines.join("\n")
}

/// Loads versioned JSON Schema files from `{dir}/{contract}/{version}.json`
/// and caches parsed documents per `contract:version`.
#[derive(Debug)]
pub struct SchemaLoader {
    schemas_dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<Value>>>,
}

impl SchemaLoader {
    pub fn new(schemas_dir: impl Into<PathBuf>) -> Self {
        Self {
            schemas_dir: schemas_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn schemas_dir(&self) -> &Path {
        &self.schemas_dir
    }

    /// Load a schema; `"latest"` resolves to the lexicographically greatest
    /// filename in the contract directory. Version filenames must sort
    /// (zero-pad past v9) — this is not a semver sort.
    pub async fn load(&self, contract: &str, version: &str) -> Result<Arc<Value>, ContractError> {
        let cache_key = format!("{contract}:{version}");
        {
            let cache = self.cache.lock().await;
            if let Some(schema) = cache.get(&cache_key) {
                debug!(%cache_key, "schema cache hit");
                return Ok(schema.clone());
            }
        }

        let path = self.resolve_path(contract, version).await?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ContractError::Io {
                path: path.clone(),
                source,
            })?;
        let schema: Value =
            serde_json::from_str(&text).map_err(|e| ContractError::InvalidSchema {
                contract: contract.to_string(),
                message: e.to_string(),
            })?;
        check_schema_shape(&schema, contract)?;

        let schema = Arc::new(schema);
        self.cache
            .lock()
            .await
            .insert(cache_key.clone(), schema.clone());
        debug!(%cache_key, path = %path.display(), "schema loaded");
        Ok(schema)
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    async fn resolve_path(&self, contract: &str, version: &str) -> Result<PathBuf, ContractError> {
        let contract_dir = self.schemas_dir.join(contract);
        if !contract_dir.is_dir() {
            return Err(ContractError::ContractNotFound(contract.to_string()));
        }

        if version == "latest" {
            let mut read_dir =
                tokio::fs::read_dir(&contract_dir)
                    .await
                    .map_err(|source| ContractError::Io {
                        path: contract_dir.clone(),
                        source,
                    })?;
            let mut candidates = Vec::new();
            while let Some(entry) = read_dir.next_entry().await.map_err(|source| {
                ContractError::Io {
                    path: contract_dir.clone(),
                    source,
                }
            })? {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    candidates.push(path);
                }
            }
            candidates.sort();
            return candidates
                .pop()
                .ok_or_else(|| ContractError::SchemaNotFound {
                    contract: contract.to_string(),
                    version: version.to_string(),
                });
        }

        let path = contract_dir.join(format!("{version}.json"));
        if !path.is_file() {
            return Err(ContractError::SchemaNotFound {
                contract: contract.to_string(),
                version: version.to_string(),
            });
        }
        Ok(path)
    }
}

fn check_schema_shape(schema: &Value, contract: &str) -> Result<(), ContractError> {
    let Some(object) = schema.as_object() else {
        return Err(ContractError::InvalidSchema {
            contract: contract.to_string(),
            message: "schema must be a JSON object".to_string(),
        });
    };
    if !object.contains_key("$schema") {
        warn!(contract, "schema is missing the $schema dialect marker");
    }
    if !object.contains_key("type") {
        return Err(ContractError::InvalidSchema {
            contract: contract.to_string(),
            message: "schema must declare a 'type'".to_string(),
        });
    }
    Ok(())
}

/// Compiled validators keyed by `contract:version`, bounded with
/// insertion-order eviction.
#[derive(Debug, Default)]
struct ValidatorCache {
    entries: HashMap<String, Arc<jsonschema::Validator>>,
    insertion_order: Vec<String>,
}

/// Validates payloads against versioned contracts with compiled-validator
/// caching.
#[derive(Debug)]
pub struct ContractManager {
    loader: SchemaLoader,
    cache: Mutex<ValidatorCache>,
    cache_size: usize,
    caching_enabled: bool,
}

impl ContractManager {
    pub fn new(schemas_dir: impl Into<PathBuf>) -> Self {
        Self::with_cache(schemas_dir, 100, true)
    }

    /// `caching_enabled = false` recompiles on every call, useful while
    /// iterating on schema files.
    pub fn with_cache(
        schemas_dir: impl Into<PathBuf>,
        cache_size: usize,
        caching_enabled: bool,
    ) -> Self {
        Self {
            loader: SchemaLoader::new(schemas_dir),
            cache: Mutex::new(ValidatorCache::default()),
            cache_size: cache_size.max(1),
            caching_enabled,
        }
    }

    pub async fn validate(
        &self,
        data: &Value,
        contract: &str,
        version: &str,
    ) -> Result<(), ContractError> {
        let validator = self.validator_for(contract, version).await?;

        let errors: Vec<FieldError> = validator.iter_errors(data).map(format_error).collect();
        if errors.is_empty() {
            debug!(contract, version, "contract validation passed");
            return Ok(());
        }

        warn!(
            contract,
            version,
            error_count = errors.len(),
            "contract validation failed"
        );
        Err(ContractError::Validation {
            contract: contract.to_string(),
            errors,
        })
    }

    pub async fn validate_user_stats(&self, data: &Value) -> Result<(), ContractError> {
        self.validate(data, USER_STATS, "v1").await
    }

    pub async fn validate_attempts_list(&self, data: &Value) -> Result<(), ContractError> {
        self.validate(data, ATTEMPTS_LIST, "v1").await
    }

    pub async fn validate_attempt_detail(&self, data: &Value) -> Result<(), ContractError> {
        self.validate(data, ATTEMPT_DETAIL, "v1").await
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cache.lock().await;
        cache.entries.clear();
        cache.insertion_order.clear();
        self.loader.clear_cache().await;
    }

    /// Number of compiled validators currently cached.
    pub async fn cached_validators(&self) -> usize {
        self.cache.lock().await.entries.len()
    }

    pub async fn is_cached(&self, contract: &str, version: &str) -> bool {
        self.cache
            .lock()
            .await
            .entries
            .contains_key(&format!("{contract}:{version}"))
    }

    async fn validator_for(
        &self,
        contract: &str,
        version: &str,
    ) -> Result<Arc<jsonschema::Validator>, ContractError> {
        let cache_key = format!("{contract}:{version}");

        if self.caching_enabled {
            let cache = self.cache.lock().await;
            if let Some(validator) = cache.entries.get(&cache_key) {
                debug!(%cache_key, "validator cache hit");
                return Ok(validator.clone());
            }
        }

        let schema = self.loader.load(contract, version).await?;
        let validator = jsonschema::options()
            .should_validate_formats(true)
            .build(&schema)
            .map_err(|e| ContractError::InvalidSchema {
                contract: contract.to_string(),
                message: e.to_string(),
            })?;
        let validator = Arc::new(validator);

        if self.caching_enabled {
            let mut cache = self.cache.lock().await;
            cache.entries.insert(cache_key.clone(), validator.clone());
            cache.insertion_order.push(cache_key.clone());
            while cache.entries.len() > self.cache_size {
                let oldest = cache.insertion_order.remove(0);
                cache.entries.remove(&oldest);
                debug!(%oldest, "evicted compiled validator");
            }
            debug!(%cache_key, "compiled and cached validator");
        }
        Ok(validator)
    }
}

fn format_error(error: jsonschema::ValidationError<'_>) -> FieldError {
    let path = error.instance_path.to_string();
    let path = if path.is_empty() {
        "root".to_string()
    } else {
        path.trim_start_matches('/').replace('/', ".")
    };
    let message = error.to_string();
    let rule = classify_rule(&error.kind, &message);
    FieldError {
        path,
        message,
        rule,
        value: Some(error.instance.as_ref().clone()),
    }
}

fn classify_rule(kind: &ValidationErrorKind, message: &str) -> RuleKind {
    match kind {
        ValidationErrorKind::Type { .. } => RuleKind::Type,
        ValidationErrorKind::Required { .. } => RuleKind::Required,
        ValidationErrorKind::Minimum { .. }
        | ValidationErrorKind::Maximum { .. }
        | ValidationErrorKind::ExclusiveMinimum { .. }
        | ValidationErrorKind::ExclusiveMaximum { .. }
        | ValidationErrorKind::MinLength { .. }
        | ValidationErrorKind::MaxLength { .. }
        | ValidationErrorKind::MinItems { .. }
        | ValidationErrorKind::MaxItems { .. }
        | ValidationErrorKind::MinProperties { .. }
        | ValidationErrorKind::MaxProperties { .. } => RuleKind::Range,
        ValidationErrorKind::Pattern { .. } => RuleKind::Pattern,
        ValidationErrorKind::Format { .. } => RuleKind::Format,
        _ => infer_rule_from_message(message),
    }
}

// Keyword fallback carried over for validator kinds with no direct mapping.
fn infer_rule_from_message(message: &str) -> RuleKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("must be") {
        RuleKind::Type
    } else if lower.contains("required") {
        RuleKind::Required
    } else if lower.contains("minimum") || lower.contains("maximum") {
        RuleKind::Range
    } else if lower.contains("pattern") {
        RuleKind::Pattern
    } else if lower.contains("format") {
        RuleKind::Format
    } else {
        RuleKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn write_schema(dir: &Path, contract: &str, version: &str, schema: &Value) {
        let contract_dir = dir.join(contract);
        tokio::fs::create_dir_all(&contract_dir).await.unwrap();
        tokio::fs::write(
            contract_dir.join(format!("{version}.json")),
            serde_json::to_vec_pretty(schema).unwrap(),
        )
        .await
        .unwrap();
    }

    fn object_schema(required: &[&str]) -> Value {
        json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "type": "object",
            "properties": {
                "student_id": {"type": "string"},
                "score": {"type": "number", "minimum": 0}
            },
            "required": required,
        })
    }

    #[tokio::test]
    async fn latest_resolves_to_greatest_version() {
        let dir = tempdir().unwrap();
        write_schema(
            dir.path(),
            "user_stats",
            "v1",
            &json!({"type": "object", "properties": {"marker": {"const": "one"}}}),
        )
        .await;
        write_schema(
            dir.path(),
            "user_stats",
            "v2",
            &json!({"type": "object", "properties": {"marker": {"const": "two"}}}),
        )
        .await;

        let loader = SchemaLoader::new(dir.path());
        let schema = loader.load("user_stats", "latest").await.unwrap();
        assert_eq!(schema["properties"]["marker"]["const"], json!("two"));
    }

    #[tokio::test]
    async fn schema_without_type_is_rejected() {
        let dir = tempdir().unwrap();
        write_schema(dir.path(), "broken", "v1", &json!({"properties": {}})).await;

        let loader = SchemaLoader::new(dir.path());
        let err = loader.load("broken", "v1").await.unwrap_err();
        assert!(matches!(err, ContractError::InvalidSchema { .. }));
    }

    #[tokio::test]
    async fn missing_contract_and_version_are_distinct_errors() {
        let dir = tempdir().unwrap();
        write_schema(dir.path(), "present", "v1", &object_schema(&[])).await;

        let loader = SchemaLoader::new(dir.path());
        assert!(matches!(
            loader.load("absent", "v1").await.unwrap_err(),
            ContractError::ContractNotFound(_)
        ));
        assert!(matches!(
            loader.load("present", "v9").await.unwrap_err(),
            ContractError::SchemaNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn validation_reports_structured_errors_with_rules() {
        let dir = tempdir().unwrap();
        write_schema(dir.path(), "user_stats", "v1", &object_schema(&["student_id"])).await;

        let manager = ContractManager::new(dir.path());
        let err = manager
            .validate(&json!({"score": -3}), "user_stats", "v1")
            .await
            .unwrap_err();

        let ContractError::Validation { contract, errors } = err else {
            panic!("expected validation error");
        };
        assert_eq!(contract, "user_stats");
        assert!(errors.iter().any(|e| e.rule == RuleKind::Required));
        assert!(errors.iter().any(|e| e.rule == RuleKind::Range));
    }

    #[tokio::test]
    async fn summary_caps_at_five_errors() {
        let errors: Vec<FieldError> = (0..8)
            .map(|i| FieldError {
                path: format!("field_{i}"),
                message: "must be string".to_string(),
                rule: RuleKind::Type,
                value: None,
            })
            .collect();
        let err = ContractError::Validation {
            contract: "user_stats".to_string(),
            errors,
        };
        let text = err.to_string();
        assert!(text.contains("1. [field_0]"));
        assert!(text.contains("5. [field_4]"));
        assert!(!text.contains("field_5"));
        assert!(text.contains("and 3 more error(s)"));
    }

    #[tokio::test]
    async fn validator_cache_evicts_oldest_past_capacity() {
        let dir = tempdir().unwrap();
        for contract in ["alpha", "beta", "gamma"] {
            write_schema(dir.path(), contract, "v1", &object_schema(&[])).await;
        }

        let manager = ContractManager::with_cache(dir.path(), 2, true);
        for contract in ["alpha", "beta", "gamma"] {
            manager
                .validate(&json!({}), contract, "v1")
                .await
                .unwrap();
        }

        assert_eq!(manager.cached_validators().await, 2);
        assert!(!manager.is_cached("alpha", "v1").await);
        assert!(manager.is_cached("beta", "v1").await);
        assert!(manager.is_cached("gamma", "v1").await);
    }

    #[tokio::test]
    async fn caching_can_be_disabled() {
        let dir = tempdir().unwrap();
        write_schema(dir.path(), "alpha", "v1", &object_schema(&[])).await;

        let manager = ContractManager::with_cache(dir.path(), 10, false);
        manager.validate(&json!({}), "alpha", "v1").await.unwrap();
        assert_eq!(manager.cached_validators().await, 0);
    }
}
