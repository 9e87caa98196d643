//! external data lookup
//!
//! Manifests read data with `lookup`, `hiera`, `hiera_array` and `hiera_hash`. The compiler only
//! knows the [DataProvider] trait; [LayeredData] is a provider over a hierarchy of YAML sources:
//!
//! ```yaml
//! # data/common.yaml
//! ntp::servers: [0.pool.ntp.org]
//! ```
//!
//! The hierarchy lists source names from highest to lowest priority. Names may contain `%{var}`,
//! which is replaced with the variable as seen from the calling scope (`nodes/%{hostname}`).
use crate::value::Value;
use indexmap::IndexMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Value of the highest priority source
    #[default]
    First,
    /// All values flattened into one array without duplicates
    Unique,
    /// Top-level keys of all hashes; higher priority wins
    Hash,
    /// Recursive merge of hashes and arrays
    Deep {
        /// Array elements and hash keys starting with this prefix remove the matching entry of
        /// lower priority sources
        knockout_prefix: Option<String>,
        sort_merged_arrays: bool,
        /// Merge arrays of hashes element by element instead of concatenating them
        merge_hash_arrays: bool,
    },
}

impl MergeStrategy {
    pub fn deep() -> Self {
        MergeStrategy::Deep {
            knockout_prefix: None,
            sort_merged_arrays: false,
            merge_hash_arrays: false,
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = LookupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(MergeStrategy::First),
            "unique" => Ok(MergeStrategy::Unique),
            "hash" => Ok(MergeStrategy::Hash),
            "deep" => Ok(MergeStrategy::deep()),
            other => Err(LookupError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LookupError {
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse data source")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Data source '{0}' must be a mapping")]
    NotAMapping(String),
    #[error("Unknown merge strategy '{0}'")]
    UnknownStrategy(String),
    #[error("Cannot merge '{key}': {message}")]
    Merge { key: String, message: String },
}

/// Variables visible to the caller of a lookup
pub type Variables<'a> = &'a dyn Fn(&str) -> Option<Value>;

pub trait DataProvider: Send + Sync + std::fmt::Debug {
    /// Look up `key`
    ///
    /// `override_source` names a source to consult before the hierarchy. `Ok(None)` means no source
    /// has the key.
    fn lookup(
        &self,
        key: &str,
        variables: Variables,
        override_source: Option<&str>,
        merge: &MergeStrategy,
    ) -> Result<Option<Value>, LookupError>;
}

#[derive(Debug, Default)]
pub struct LayeredData {
    hierarchy: Vec<String>,
    sources: IndexMap<String, IndexMap<String, Value>>,
}

impl LayeredData {
    pub fn new(hierarchy: Vec<String>) -> Self {
        Self {
            hierarchy,
            sources: Default::default(),
        }
    }

    pub fn add_source(&mut self, name: impl Into<String>, data: IndexMap<String, Value>) {
        let name = name.into();
        tracing::debug!(source = name, keys = data.len(), "data source added");
        self.sources.insert(name, data);
    }

    /// Add a source from a yaml mapping
    pub fn add_yaml(&mut self, name: impl Into<String>, yaml: &str) -> Result<(), LookupError> {
        let name = name.into();
        let data = match Value::from(serde_yaml::from_str::<serde_yaml::Value>(yaml)?) {
            Value::Hash(data) => data,
            Value::Undef => IndexMap::new(),
            _ => return Err(LookupError::NotAMapping(name)),
        };

        self.add_source(name, data);
        Ok(())
    }

    /// Load a yaml file as a source named after the file stem
    ///
    /// Sources that are not part of the hierarchy yet are appended at the lowest priority.
    pub fn load_file(&mut self, path: &Path) -> Result<(), LookupError> {
        tracing::info!(path=%path.display(), "loading data source");
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();

        self.add_yaml(name.clone(), &std::fs::read_to_string(path)?)?;
        if !self.hierarchy.contains(&name) {
            self.hierarchy.push(name);
        }
        Ok(())
    }

    fn resolve(&self, template: &str, variables: Variables) -> String {
        let mut out = String::new();
        let mut rest = template;

        while let Some(start) = rest.find("%{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };

            let name = after[..end].trim().trim_start_matches("::");
            if let Some(value) = variables(name) {
                out.push_str(&value.to_string());
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        out
    }
}

impl DataProvider for LayeredData {
    fn lookup(
        &self,
        key: &str,
        variables: Variables,
        override_source: Option<&str>,
        merge: &MergeStrategy,
    ) -> Result<Option<Value>, LookupError> {
        let mut names: Vec<String> = override_source.map(str::to_string).into_iter().collect();
        names.extend(
            self.hierarchy
                .iter()
                .map(|template| self.resolve(template, variables)),
        );

        let found: Vec<Value> = names
            .iter()
            .filter_map(|name| self.sources.get(name))
            .filter_map(|data| data.get(key))
            .cloned()
            .collect();

        tracing::trace!(key, sources = found.len(), ?merge, "lookup");
        if found.is_empty() {
            return Ok(None);
        }

        merge_values(key, found, merge).map(Some)
    }
}

/// Merge values ordered from highest to lowest priority
pub fn merge_values(key: &str, values: Vec<Value>, merge: &MergeStrategy) -> Result<Value, LookupError> {
    match merge {
        MergeStrategy::First => Ok(values.into_iter().next().unwrap_or_default()),
        MergeStrategy::Unique => {
            let mut merged: Vec<Value> = vec![];
            for value in values.into_iter().flat_map(Value::flatten) {
                if !merged.contains(&value) {
                    merged.push(value);
                }
            }
            Ok(Value::Array(merged))
        }
        MergeStrategy::Hash => {
            let mut merged: IndexMap<String, Value> = IndexMap::new();
            for value in values {
                let hash = match value {
                    Value::Hash(hash) => hash,
                    other => {
                        return Err(LookupError::Merge {
                            key: key.to_string(),
                            message: format!("hash merge requires hashes, found {}", other.kind()),
                        })
                    }
                };
                for (name, value) in hash {
                    merged.entry(name).or_insert(value);
                }
            }
            Ok(Value::Hash(merged))
        }
        MergeStrategy::Deep {
            knockout_prefix,
            sort_merged_arrays,
            merge_hash_arrays,
        } => {
            let options = DeepOptions {
                knockout_prefix: knockout_prefix.as_deref(),
                sort_merged_arrays: *sort_merged_arrays,
                merge_hash_arrays: *merge_hash_arrays,
            };

            let mut values = values.into_iter();
            let mut merged = values.next().unwrap_or_default();
            for lower in values {
                merged = options.merge(merged, lower);
            }
            Ok(options.strip_knockouts(merged))
        }
    }
}

struct DeepOptions<'a> {
    knockout_prefix: Option<&'a str>,
    sort_merged_arrays: bool,
    merge_hash_arrays: bool,
}

impl<'a> DeepOptions<'a> {
    fn knocked_out<'v>(&self, marker: &'v str) -> Option<&'v str> {
        self.knockout_prefix
            .filter(|prefix| !prefix.is_empty())
            .and_then(|prefix| marker.strip_prefix(prefix))
    }

    /// Merge `lower` into `higher`; knockout markers stay in place until [Self::strip_knockouts]
    fn merge(&self, higher: Value, lower: Value) -> Value {
        match (higher, lower) {
            (Value::Hash(mut higher), Value::Hash(lower)) => {
                let knocked: Vec<String> = higher
                    .keys()
                    .filter_map(|key| self.knocked_out(key).map(str::to_string))
                    .collect();

                for (key, value) in lower {
                    if knocked.contains(&key) {
                        continue;
                    }
                    match higher.get_mut(&key) {
                        Some(existing) => {
                            let merged = self.merge(std::mem::take(existing), value);
                            *existing = merged;
                        }
                        None => {
                            higher.insert(key, value);
                        }
                    }
                }
                Value::Hash(higher)
            }
            (Value::Array(higher), Value::Array(lower)) => {
                let all_hashes = |items: &[Value]| items.iter().all(|item| matches!(item, Value::Hash(_)));
                if self.merge_hash_arrays && all_hashes(&higher) && all_hashes(&lower) {
                    let mut lower = lower.into_iter();
                    let mut merged: Vec<Value> = higher
                        .into_iter()
                        .map(|item| match lower.next() {
                            Some(other) => self.merge(item, other),
                            None => item,
                        })
                        .collect();
                    merged.extend(lower);
                    return Value::Array(merged);
                }

                let knocked: Vec<String> = higher
                    .iter()
                    .filter_map(|item| item.as_str().and_then(|s| self.knocked_out(s)).map(str::to_string))
                    .collect();

                let mut merged = higher;
                for item in lower {
                    let is_knocked = item.as_str().map(|s| knocked.iter().any(|k| k == s)).unwrap_or(false);
                    if !is_knocked && !merged.contains(&item) {
                        merged.push(item);
                    }
                }
                Value::Array(merged)
            }
            (higher, _) => higher,
        }
    }

    fn strip_knockouts(&self, value: Value) -> Value {
        match value {
            Value::Hash(hash) => Value::Hash(
                hash.into_iter()
                    .filter(|(key, _)| self.knocked_out(key).is_none())
                    .map(|(key, value)| (key, self.strip_knockouts(value)))
                    .collect(),
            ),
            Value::Array(items) => {
                let mut items: Vec<Value> = items
                    .into_iter()
                    .filter(|item| item.as_str().and_then(|s| self.knocked_out(s)).is_none())
                    .map(|item| self.strip_knockouts(item))
                    .collect();
                if self.sort_merged_arrays {
                    items.sort_by_key(|item| item.to_string());
                }
                Value::Array(items)
            }
            other => other,
        }
    }
}
