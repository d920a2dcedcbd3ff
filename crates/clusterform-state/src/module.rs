//! Module naming conventions and typed views over module records
//!
//! The state document stores every module as an opaque JSON object. The
//! structs here give typed access to the handful of fields the state layer
//! actually inspects, while `settings` carries every other field through
//! unchanged.

use crate::error::{Result, StateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Name of the single cluster manager module in a document
pub const MANAGER_MODULE: &str = "cluster-manager";

/// Output of a cluster module that nodes reference to join it
pub const ENVIRONMENT_OUTPUT: &str = "rancher_environment_id";

/// Field of a node record holding the reference to its cluster
pub const ENVIRONMENT_FIELD: &str = "rancher_environment_id";

/// Deferred reference to the manager API endpoint, resolved by terraform
pub const MANAGER_API_URL: &str = "http://${element(module.cluster-manager.masters, 0)}:8080";

/// Cloud providers a module can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Triton,
    Aws,
    Azure,
    Gcp,
    BareMetal,
    Vsphere,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::Triton,
        Provider::Aws,
        Provider::Azure,
        Provider::Gcp,
        Provider::BareMetal,
        Provider::Vsphere,
    ];

    /// Stable identifier used in module names and template paths
    pub fn slug(&self) -> &'static str {
        match self {
            Provider::Triton => "triton",
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
            Provider::BareMetal => "bare-metal",
            Provider::Vsphere => "vsphere",
        }
    }

    /// Account and credential fields a node copies from its cluster record
    pub fn credential_fields(&self) -> &'static [&'static str] {
        match self {
            Provider::Triton => &[
                "triton_account",
                "triton_key_path",
                "triton_key_id",
                "triton_url",
            ],
            Provider::Aws => &["aws_access_key", "aws_secret_key", "aws_region"],
            Provider::Azure => &[
                "azure_subscription_id",
                "azure_client_id",
                "azure_client_secret",
                "azure_tenant_id",
                "azure_environment",
                "azure_location",
            ],
            Provider::Gcp => &[
                "gcp_path_to_credentials",
                "gcp_project_id",
                "gcp_compute_region",
            ],
            Provider::BareMetal => &[],
            Provider::Vsphere => &[
                "vsphere_user",
                "vsphere_password",
                "vsphere_server",
                "vsphere_datacenter_name",
            ],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

impl FromStr for Provider {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        Provider::ALL
            .into_iter()
            .find(|p| p.slug() == s)
            .ok_or_else(|| {
                StateError::InvalidInput(format!(
                    "unknown provider '{}', expected one of: {}",
                    s,
                    Provider::ALL.map(|p| p.slug()).join(", ")
                ))
            })
    }
}

/// Role of a module, derived from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Manager,
    Cluster(Provider),
    Node(Provider),
}

impl ModuleKind {
    /// Classify a module name; `None` for modules outside the convention
    pub fn of(name: &str) -> Option<ModuleKind> {
        if name == MANAGER_MODULE {
            return Some(ModuleKind::Manager);
        }
        for provider in Provider::ALL {
            let rest = |prefix: &str| {
                name.strip_prefix(prefix)
                    .and_then(|r| r.strip_prefix(provider.slug()))
                    .and_then(|r| r.strip_prefix('_'))
                    .is_some_and(|r| !r.is_empty())
            };
            if rest("cluster_") {
                return Some(ModuleKind::Cluster(provider));
            }
            if rest("node_") {
                return Some(ModuleKind::Node(provider));
            }
        }
        None
    }
}

/// `cluster_<provider>_<name>`
pub fn cluster_module_name(provider: Provider, name: &str) -> String {
    format!("cluster_{}_{}", provider.slug(), name)
}

/// `node_<provider>_<cluster>_<hostname>`
pub fn node_module_name(provider: Provider, cluster: &str, hostname: &str) -> String {
    format!("node_{}_{}_{}", provider.slug(), cluster, hostname)
}

/// Deferred reference to an output of another module
pub fn module_reference(module: &str, output: &str) -> String {
    format!("${{module.{}.{}}}", module, output)
}

/// The reference a node uses to join `cluster_module`
pub fn environment_reference(cluster_module: &str) -> String {
    module_reference(cluster_module, ENVIRONMENT_OUTPUT)
}

/// Serialize a typed module into the opaque record form the document stores
pub fn to_record<T: Serialize>(module: &T) -> Result<Value> {
    let value = serde_json::to_value(module)?;
    if !value.is_object() {
        return Err(StateError::InvalidInput(
            "module record must serialize to a JSON object".to_string(),
        ));
    }
    Ok(value)
}

/// Cluster manager module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerModule {
    pub source: String,

    pub name: String,

    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

/// Cluster module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterModule {
    pub source: String,

    pub name: String,

    pub rancher_api_url: String,

    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

/// Node module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeModule {
    pub source: String,

    pub hostname: String,

    pub rancher_api_url: String,

    /// Reference to the owning cluster's environment output
    pub rancher_environment_id: String,

    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

impl NodeModule {
    /// Module name of the cluster this node joins, read from its reference
    pub fn cluster_module(&self) -> Option<&str> {
        cluster_of_reference(&self.rancher_environment_id)
    }
}

/// Extract `<cluster>` from `${module.<cluster>.rancher_environment_id}`
pub fn cluster_of_reference(reference: &str) -> Option<&str> {
    reference
        .strip_prefix("${module.")?
        .strip_suffix("}")?
        .strip_suffix(ENVIRONMENT_OUTPUT)?
        .strip_suffix('.')
        .filter(|m| !m.is_empty() && !m.contains('.'))
}
