use crate::compat::FeatureCompatibilityVersion;
use crate::cursor::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_AWAIT};
use crate::oplog::RetentionPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

type ConfigMap = Map<String, Value>;

pub const FCV_PARAMETER: &str = "featureCompatibilityVersion";
pub const RETENTION_PARAMETER: &str = "oplogMaxEntries";

/// Typed view of the server parameters consulted by change streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerParameters {
    #[serde(with = "fcv_string")]
    pub feature_compatibility_version: FeatureCompatibilityVersion,
    #[serde(default = "default_batch_size")]
    pub change_stream_batch_size: usize,
    #[serde(default = "default_max_await_ms")]
    pub change_stream_max_await_ms: u64,
    /// Retained log entries; `None` keeps everything.
    #[serde(default)]
    pub oplog_max_entries: Option<usize>,
}

impl Default for ServerParameters {
    fn default() -> Self {
        Self {
            feature_compatibility_version: FeatureCompatibilityVersion::V42,
            change_stream_batch_size: DEFAULT_BATCH_SIZE,
            change_stream_max_await_ms: default_max_await_ms(),
            oplog_max_entries: None,
        }
    }
}

impl ServerParameters {
    /// Parses and validates a parameter blob.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let params: ServerParameters = serde_json::from_value(value.clone())
            .map_err(|err| ConfigError::InvalidPatch(err.to_string()))?;
        if params.change_stream_batch_size == 0 {
            return Err(ConfigError::InvalidPatch(
                "changeStreamBatchSize must be positive".into(),
            ));
        }
        if params.oplog_max_entries == Some(0) {
            return Err(ConfigError::InvalidPatch(
                "oplogMaxEntries must be positive".into(),
            ));
        }
        Ok(params)
    }

    pub fn max_await(&self) -> Duration {
        Duration::from_millis(self.change_stream_max_await_ms)
    }

    pub fn retention(&self) -> RetentionPolicy {
        match self.oplog_max_entries {
            Some(max_entries) => RetentionPolicy::max_entries(max_entries),
            None => RetentionPolicy::unbounded(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            FCV_PARAMETER: self.feature_compatibility_version.as_str(),
            "changeStreamBatchSize": self.change_stream_batch_size,
            "changeStreamMaxAwaitMs": self.change_stream_max_await_ms,
            RETENTION_PARAMETER: self.oplog_max_entries,
        })
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_await_ms() -> u64 {
    millis(DEFAULT_MAX_AWAIT)
}

mod fcv_string {
    use crate::compat::FeatureCompatibilityVersion;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        fcv: &FeatureCompatibilityVersion,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(fcv.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<FeatureCompatibilityVersion, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Service responsible for tracking versioned server parameter blobs.
#[derive(Debug, Clone)]
pub struct ConfigService {
    current_version: u64,
    current: ConfigMap,
    parameters: ServerParameters,
    snapshots: BTreeMap<u64, ConfigMap>,
    knob_catalog: BTreeMap<String, ConfigKnobClass>,
    telemetry: ConfigTelemetry,
}

impl Default for ConfigService {
    fn default() -> Self {
        Self::from_parameters(&ServerParameters::default())
    }
}

impl ConfigService {
    /// Creates a service seeded with the provided parameter blob.
    pub fn new(initial: Value) -> Result<Self, ConfigError> {
        let map = initial.as_object().cloned().ok_or_else(|| {
            ConfigError::InvalidPatch("initial config must be a JSON object".into())
        })?;
        let parameters = ServerParameters::from_value(&Value::Object(map.clone()))?;
        let mut snapshots = BTreeMap::new();
        snapshots.insert(1, map.clone());
        Ok(Self {
            current_version: 1,
            current: map,
            parameters,
            snapshots,
            knob_catalog: default_knob_catalog(),
            telemetry: ConfigTelemetry::new(1),
        })
    }

    pub fn from_parameters(parameters: &ServerParameters) -> Self {
        let map = match parameters.to_value() {
            Value::Object(map) => map,
            _ => ConfigMap::new(),
        };
        let mut snapshots = BTreeMap::new();
        snapshots.insert(1, map.clone());
        Self {
            current_version: 1,
            current: map,
            parameters: parameters.clone(),
            snapshots,
            knob_catalog: default_knob_catalog(),
            telemetry: ConfigTelemetry::new(1),
        }
    }

    /// Loads the initial parameter blob from a JSON file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(value)
    }

    /// Returns the active config version.
    pub fn version(&self) -> u64 {
        self.current_version
    }

    /// Returns the current configuration blob.
    pub fn current_config(&self) -> Value {
        Value::Object(self.current.clone())
    }

    /// Typed parameters for the active version.
    pub fn parameters(&self) -> &ServerParameters {
        &self.parameters
    }

    pub fn feature_compatibility_version(&self) -> FeatureCompatibilityVersion {
        self.parameters.feature_compatibility_version
    }

    /// Returns telemetry counters for observability.
    pub fn telemetry(&self) -> &ConfigTelemetry {
        &self.telemetry
    }

    /// Sets the feature compatibility version; new sessions pick it up.
    pub fn set_feature_compatibility_version(
        &mut self,
        fcv: FeatureCompatibilityVersion,
    ) -> Result<ConfigPatchResult, ConfigError> {
        self.patch(json!({ FCV_PARAMETER: fcv.as_str() }))
    }

    /// Applies a PATCH-style update. Rejected patches leave the active
    /// version untouched.
    pub fn patch(&mut self, patch: Value) -> Result<ConfigPatchResult, ConfigError> {
        let start = Instant::now();
        let patch_map = patch
            .as_object()
            .cloned()
            .ok_or_else(|| self.invalid_patch("patch must be a JSON object"))?;
        let mut next = self.current.clone();
        let mut changed = BTreeMap::new();
        merge_map(&mut next, &patch_map, &mut changed);
        if changed.is_empty() {
            return Ok(ConfigPatchResult::no_change(self.current_version));
        }
        self.commit(next, changed.keys().cloned().collect(), start.elapsed())
    }

    /// Rolls the configuration back to a previous version and records a new snapshot.
    pub fn rollback(&mut self, to_version: u64) -> Result<ConfigPatchResult, ConfigError> {
        if to_version == self.current_version {
            self.validation_failure();
            return Err(ConfigError::UnknownVersion(to_version));
        }
        let snapshot = match self.snapshots.get(&to_version).cloned() {
            Some(snapshot) => snapshot,
            None => {
                self.validation_failure();
                return Err(ConfigError::UnknownVersion(to_version));
            }
        };
        let start = Instant::now();
        let changed_keys = diff_keys(&self.current, &snapshot);
        self.commit(snapshot, changed_keys, start.elapsed())
    }

    fn commit(
        &mut self,
        next: ConfigMap,
        mut changed_keys: Vec<String>,
        elapsed: Duration,
    ) -> Result<ConfigPatchResult, ConfigError> {
        let parameters = match ServerParameters::from_value(&Value::Object(next.clone())) {
            Ok(parameters) => parameters,
            Err(err) => {
                self.validation_failure();
                return Err(err);
            }
        };
        self.current_version += 1;
        let impact = classify_change(&self.knob_catalog, &changed_keys);
        self.current = next.clone();
        self.parameters = parameters;
        self.snapshots.insert(self.current_version, next);
        changed_keys.sort();
        self.telemetry.version = self.current_version;
        self.telemetry.last_reload_duration_ms = millis(elapsed);
        Ok(ConfigPatchResult {
            version: self.current_version,
            impact,
            changed_keys,
            duration_ms: self.telemetry.last_reload_duration_ms,
        })
    }

    fn invalid_patch(&mut self, msg: &str) -> ConfigError {
        self.validation_failure();
        ConfigError::InvalidPatch(msg.to_string())
    }

    fn validation_failure(&mut self) {
        self.telemetry.validation_failures_total =
            self.telemetry.validation_failures_total.saturating_add(1);
    }
}

fn merge_map(base: &mut ConfigMap, patch: &ConfigMap, changed: &mut BTreeMap<String, ()>) {
    for (key, value) in patch {
        let entry = base.entry(key.clone()).or_insert(Value::Null);
        if entry != value {
            *entry = value.clone();
            changed.insert(key.clone(), ());
        }
    }
}

fn diff_keys(current: &ConfigMap, snapshot: &ConfigMap) -> Vec<String> {
    let mut keys = BTreeMap::new();
    for key in current.keys().chain(snapshot.keys()) {
        keys.insert(key.clone(), ());
    }
    keys.into_keys()
        .filter(|key| current.get(key) != snapshot.get(key))
        .collect()
}

fn classify_change(
    catalog: &BTreeMap<String, ConfigKnobClass>,
    changed_keys: &[String],
) -> ConfigKnobClass {
    changed_keys
        .iter()
        .map(|key| catalog.get(key).copied().unwrap_or(ConfigKnobClass::Hot))
        .max()
        .unwrap_or(ConfigKnobClass::Hot)
}

fn default_knob_catalog() -> BTreeMap<String, ConfigKnobClass> {
    [
        (FCV_PARAMETER.to_string(), ConfigKnobClass::NewSessions),
        ("changeStreamBatchSize".to_string(), ConfigKnobClass::NewSessions),
        ("changeStreamMaxAwaitMs".to_string(), ConfigKnobClass::NewSessions),
        (RETENTION_PARAMETER.to_string(), ConfigKnobClass::Hot),
    ]
    .into_iter()
    .collect()
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Result of applying a patch or rollback.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigPatchResult {
    pub version: u64,
    pub impact: ConfigKnobClass,
    pub changed_keys: Vec<String>,
    pub duration_ms: u64,
}

impl ConfigPatchResult {
    fn no_change(version: u64) -> Self {
        Self {
            version,
            impact: ConfigKnobClass::Hot,
            changed_keys: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// When a changed parameter takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, PartialOrd, Ord)]
pub enum ConfigKnobClass {
    /// Applied immediately, including to open cursors.
    Hot = 0,
    /// Read at session establishment; open cursors keep their old value.
    NewSessions = 1,
}

/// Telemetry counters for the parameter service.
#[derive(Debug, Clone, Default)]
pub struct ConfigTelemetry {
    pub version: u64,
    pub last_reload_duration_ms: u64,
    pub validation_failures_total: u64,
}

impl ConfigTelemetry {
    fn new(version: u64) -> Self {
        Self {
            version,
            last_reload_duration_ms: 0,
            validation_failures_total: 0,
        }
    }
}

/// Errors surfaced by the config service.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config patch: {0}")]
    InvalidPatch(String),
    #[error("unknown config version {0}")]
    UnknownVersion(u64),
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
