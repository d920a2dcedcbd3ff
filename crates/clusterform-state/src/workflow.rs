//! Fully resolved requests and the document changes they make
//!
//! Interactive prompting happens elsewhere. By the time a request reaches
//! this module every field is known, and applying it is a pure change to a
//! [`StateDocument`].

use crate::document::StateDocument;
use crate::error::{Result, StateError};
use crate::module::{
    self, ClusterModule, MANAGER_API_URL, MANAGER_MODULE, ManagerModule, ModuleKind, NodeModule,
    Provider,
};
use crate::naming;
use serde_json::Value;
use std::collections::BTreeMap;

/// Module sources unless configured otherwise
pub const DEFAULT_SOURCE_URL: &str = "github.com/joyent/triton-kubernetes";

/// Extra module fields keyed by field name
pub type Settings = BTreeMap<String, Value>;

/// Builds `source` fields of generated modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSources {
    base_url: String,
}

impl Default for ModuleSources {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_URL)
    }
}

impl ModuleSources {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn manager(&self, provider: Provider) -> String {
        self.template(&format!("{}-rancher", provider.slug()))
    }

    pub fn cluster(&self, provider: Provider) -> String {
        self.template(&format!("{}-rancher-k8s", provider.slug()))
    }

    pub fn node(&self, provider: Provider) -> String {
        self.template(&format!("{}-rancher-k8s-host", provider.slug()))
    }

    fn template(&self, name: &str) -> String {
        format!("{}//terraform/modules/{}", self.base_url, name)
    }
}

/// Fields the typed module views own; settings may not override them
fn check_settings(settings: &Settings, reserved: &[&str]) -> Result<()> {
    match reserved.iter().find(|key| settings.contains_key(**key)) {
        Some(key) => Err(StateError::InvalidInput(format!(
            "'{}' is set by clusterform and cannot be overridden",
            key
        ))),
        None => Ok(()),
    }
}

/// Cluster names and hostnames are joined with `_` into module names, so
/// they may not contain it
fn is_name_segment(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Create (or replace) the cluster manager of a target
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerRequest {
    pub name: String,
    pub provider: Provider,
    pub settings: Settings,
}

impl ManagerRequest {
    /// Returns the manager's module name
    pub fn apply_to(
        &self,
        document: &mut StateDocument,
        sources: &ModuleSources,
    ) -> Result<String> {
        if self.name.is_empty() {
            return Err(StateError::InvalidInput(
                "manager name must not be empty".to_string(),
            ));
        }
        check_settings(&self.settings, &["source", "name"])?;
        let manager = ManagerModule {
            source: sources.manager(self.provider),
            name: self.name.clone(),
            settings: self.settings.clone(),
        };
        document.set_manager(&manager)?;
        Ok(MANAGER_MODULE.to_string())
    }
}

/// Add a cluster to an existing manager
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRequest {
    pub name: String,
    pub provider: Provider,
    pub settings: Settings,
}

impl ClusterRequest {
    /// Returns the cluster's module name
    pub fn apply_to(
        &self,
        document: &mut StateDocument,
        sources: &ModuleSources,
    ) -> Result<String> {
        if !is_name_segment(&self.name) {
            return Err(StateError::InvalidInput(format!(
                "invalid cluster name '{}': use letters, digits and '-' only",
                self.name
            )));
        }
        if document.manager().is_none() {
            return Err(StateError::NotFound(format!(
                "no '{}' module; create the manager first",
                MANAGER_MODULE
            )));
        }
        check_settings(&self.settings, &["source", "name", "rancher_api_url"])?;
        let cluster = ClusterModule {
            source: sources.cluster(self.provider),
            name: self.name.clone(),
            rancher_api_url: MANAGER_API_URL.to_string(),
            settings: self.settings.clone(),
        };
        document.add_cluster(self.provider, &cluster)
    }
}

/// Add one or more nodes to a cluster
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRequest {
    /// Cluster name or cluster module name
    pub cluster: String,

    /// Must match the cluster's provider when given
    pub provider: Option<Provider>,

    /// Base hostname; numbered when taken or when `count > 1`
    pub hostname: String,

    pub count: usize,

    pub settings: Settings,
}

impl NodeRequest {
    /// Returns the assigned hostnames
    pub fn apply_to(
        &self,
        document: &mut StateDocument,
        sources: &ModuleSources,
    ) -> Result<Vec<String>> {
        if !is_name_segment(&self.hostname) {
            return Err(StateError::InvalidInput(format!(
                "invalid hostname '{}': use letters, digits and '-' only",
                self.hostname
            )));
        }
        if self.count == 0 {
            return Err(StateError::InvalidInput(
                "node count must be at least 1".to_string(),
            ));
        }
        check_settings(
            &self.settings,
            &[
                "source",
                "hostname",
                "rancher_api_url",
                module::ENVIRONMENT_FIELD,
            ],
        )?;

        let cluster_module = document
            .resolve_cluster(&self.cluster)
            .ok_or_else(|| {
                StateError::NotFound(format!("cluster '{}' does not exist", self.cluster))
            })?
            .to_string();
        let Some(ModuleKind::Cluster(provider)) = ModuleKind::of(&cluster_module) else {
            return Err(StateError::NotFound(format!(
                "cluster '{}' does not exist",
                self.cluster
            )));
        };
        if let Some(requested) = self.provider.filter(|p| *p != provider) {
            return Err(StateError::InvalidInput(format!(
                "cluster '{}' runs on {}, not {}",
                self.cluster, provider, requested
            )));
        }
        let cluster_name = cluster_module
            .strip_prefix(&module::cluster_module_name(provider, ""))
            .unwrap_or(&cluster_module)
            .to_string();

        let existing = document.node_hostnames(&cluster_module);
        let hostnames = naming::node_names(&existing, &self.hostname, self.count);

        let mut settings = self.settings.clone();
        for field in provider.credential_fields() {
            if let Some(value) = document.get(&format!("module.{}.{}", cluster_module, field)) {
                settings.insert(field.to_string(), value.clone());
            }
        }

        for hostname in &hostnames {
            let module_name = module::node_module_name(provider, &cluster_name, hostname);
            if existing.contains(hostname) || document.contains(&module_name) {
                return Err(StateError::NamingCollision(format!(
                    "node '{}' already exists in cluster '{}'",
                    hostname, cluster_name
                )));
            }
            let node = NodeModule {
                source: sources.node(provider),
                hostname: hostname.clone(),
                rancher_api_url: MANAGER_API_URL.to_string(),
                rancher_environment_id: module::environment_reference(&cluster_module),
                settings: settings.clone(),
            };
            document.add_node(provider, &cluster_name, &node)?;
        }
        Ok(hostnames)
    }
}

/// Module names removed when destroying a cluster
pub fn select_cluster(document: &StateDocument, cluster: &str) -> Result<Vec<String>> {
    document
        .resolve_cluster(cluster)
        .map(|name| vec![name.to_string()])
        .ok_or_else(|| StateError::NotFound(format!("cluster '{}' does not exist", cluster)))
}

/// Module names of the given nodes of a cluster
pub fn select_nodes(
    document: &StateDocument,
    cluster: &str,
    hostnames: &[String],
) -> Result<Vec<String>> {
    let cluster_module = document
        .resolve_cluster(cluster)
        .ok_or_else(|| StateError::NotFound(format!("cluster '{}' does not exist", cluster)))?;
    let nodes = document.nodes(cluster_module);
    hostnames
        .iter()
        .map(|hostname| {
            nodes
                .iter()
                .find(|name| {
                    document.get_string(&format!("module.{}.hostname", name)) == *hostname
                })
                .map(|name| name.to_string())
                .ok_or_else(|| {
                    StateError::NotFound(format!(
                        "node '{}' does not exist in cluster '{}'",
                        hostname, cluster
                    ))
                })
        })
        .collect()
}
