//! The state document
//!
//! A document is the literal `main.tf.json` handed to terraform: a JSON object
//! whose `module` key maps module names to module records. It is the single
//! description of every manager, cluster and node under one target.

use crate::error::{Result, StateError};
use crate::module::{
    self, ClusterModule, ENVIRONMENT_FIELD, MANAGER_MODULE, ModuleKind, NodeModule, Provider,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Top-level key holding the module graph
pub const MODULE_KEY: &str = "module";

const MODULE_PATH_PREFIX: &str = "module.";

/// In-memory working copy of a target's state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDocument {
    /// Module records by name
    modules: BTreeMap<String, Value>,

    /// Top-level keys other than `module`, carried through untouched
    extra: BTreeMap<String, Value>,
}

impl StateDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse document bytes
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let root: Value = serde_json::from_slice(bytes)
            .map_err(|e| StateError::Decode(format!("not valid JSON: {}", e)))?;
        let Value::Object(root) = root else {
            return Err(StateError::Decode(
                "top level must be a JSON object".to_string(),
            ));
        };

        let mut document = StateDocument::new();
        for (key, value) in root {
            if key != MODULE_KEY {
                document.extra.insert(key, value);
                continue;
            }
            let Value::Object(modules) = value else {
                return Err(StateError::Decode(format!(
                    "'{}' must be a JSON object",
                    MODULE_KEY
                )));
            };
            for (name, record) in modules {
                if !record.is_object() {
                    return Err(StateError::Decode(format!(
                        "module '{}' must be a JSON object",
                        name
                    )));
                }
                document.modules.insert(name, record);
            }
        }

        tracing::debug!("Loaded state document with {} modules", document.len());
        Ok(document)
    }

    /// Serialize deterministically: sorted keys at every depth, tab indented
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let mut root = Map::new();
        for (key, value) in &self.extra {
            root.insert(key.clone(), canonical(value));
        }
        if !self.modules.is_empty() {
            let modules: Map<String, Value> = self
                .modules
                .iter()
                .map(|(name, record)| (name.clone(), canonical(record)))
                .collect();
            root.insert(MODULE_KEY.to_string(), Value::Object(modules));
        }
        let root = canonical(&Value::Object(root));

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        root.serialize(&mut serializer)?;
        buf.push(b'\n');
        Ok(buf)
    }

    /// Insert or replace a module record (last write wins)
    ///
    /// `name` may be given bare (`x`) or as a path (`module.x`).
    pub fn add(&mut self, name: &str, record: Value) -> Result<()> {
        let name = name.strip_prefix(MODULE_PATH_PREFIX).unwrap_or(name);
        if name.is_empty() || name.contains('.') {
            return Err(StateError::InvalidInput(format!(
                "invalid module name '{}'",
                name
            )));
        }
        if !record.is_object() {
            return Err(StateError::InvalidInput(format!(
                "record for module '{}' must be a JSON object",
                name
            )));
        }
        if self.modules.insert(name.to_string(), record).is_some() {
            tracing::debug!("Replaced module {}", name);
        } else {
            tracing::debug!("Added module {}", name);
        }
        Ok(())
    }

    /// Insert or replace a module from any serializable record type
    pub fn add_record<T: Serialize>(&mut self, name: &str, record: &T) -> Result<()> {
        self.add(name, module::to_record(record)?)
    }

    /// Set the cluster manager module
    pub fn set_manager<T: Serialize>(&mut self, record: &T) -> Result<()> {
        self.add_record(MANAGER_MODULE, record)
    }

    /// Add a cluster module, returning its module name
    ///
    /// Cluster names are unique across providers because node module names
    /// embed the cluster name.
    pub fn add_cluster(&mut self, provider: Provider, cluster: &ClusterModule) -> Result<String> {
        let module_name = module::cluster_module_name(provider, &cluster.name);
        if let Some(other) = self
            .resolve_cluster(&cluster.name)
            .filter(|other| *other != module_name)
        {
            return Err(StateError::InvalidInput(format!(
                "cluster name '{}' is already used by module '{}'",
                cluster.name, other
            )));
        }
        self.add_record(&module_name, cluster)?;
        Ok(module_name)
    }

    /// Add a node module under the cluster named `cluster`, returning its module name
    pub fn add_node(
        &mut self,
        provider: Provider,
        cluster: &str,
        node: &NodeModule,
    ) -> Result<String> {
        let module_name = module::node_module_name(provider, cluster, &node.hostname);
        self.add_record(&module_name, node)?;
        Ok(module_name)
    }

    /// Remove a module, returning its record
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let name = name.strip_prefix(MODULE_PATH_PREFIX).unwrap_or(name);
        let removed = self.modules.remove(name);
        if removed.is_some() {
            tracing::debug!("Removed module {}", name);
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Raw record of a module
    pub fn module(&self, name: &str) -> Option<&Value> {
        self.modules.get(name)
    }

    /// Typed view of a module record
    pub fn typed<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.modules
            .get(name)
            .map(|record| {
                serde_json::from_value(record.clone()).map_err(|e| {
                    StateError::Decode(format!("module '{}' has unexpected shape: {}", name, e))
                })
            })
            .transpose()
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn manager(&self) -> Option<&Value> {
        self.modules.get(MANAGER_MODULE)
    }

    /// Module names of all clusters
    pub fn clusters(&self) -> Vec<&str> {
        self.module_names()
            .filter(|name| matches!(ModuleKind::of(name), Some(ModuleKind::Cluster(_))))
            .collect()
    }

    /// Find a cluster module by module name or by its `name` field
    pub fn resolve_cluster(&self, name: &str) -> Option<&str> {
        self.clusters().into_iter().find(|module_name| {
            *module_name == name
                || self
                    .modules
                    .get(*module_name)
                    .and_then(|record| record.get("name"))
                    .and_then(Value::as_str)
                    == Some(name)
        })
    }

    /// Module names of the nodes that join `cluster_module`
    pub fn nodes(&self, cluster_module: &str) -> Vec<&str> {
        let reference = module::environment_reference(cluster_module);
        self.modules
            .iter()
            .filter(|(name, _)| matches!(ModuleKind::of(name), Some(ModuleKind::Node(_))))
            .filter(|(_, record)| {
                record.get(ENVIRONMENT_FIELD).and_then(Value::as_str) == Some(reference.as_str())
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Hostnames already taken by nodes of `cluster_module`
    pub fn node_hostnames(&self, cluster_module: &str) -> BTreeSet<String> {
        self.nodes(cluster_module)
            .into_iter()
            .filter_map(|name| self.modules.get(name))
            .filter_map(|record| record.get("hostname").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    /// Resolve a dotted path such as `module.cluster-manager.name`
    ///
    /// Numeric segments index into sequences. Missing paths yield `None`:
    /// a module that has not been applied yet is a legal state.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let mut current = if head == MODULE_KEY {
            self.modules.get(segments.next()?)?
        } else {
            self.extra.get(head)?
        };
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Like [`get`](Self::get) but returns `""` unless the path resolves to a string
    pub fn get_string(&self, path: &str) -> String {
        self.get(path)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Rebuild every object with lexicographically ordered keys
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
