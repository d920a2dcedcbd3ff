use clusterform_config::{BackendSettings, Settings as Config};
use clusterform_state::{
    Backend, HttpObjectStore, LocalBackend, ModuleSources, ProvisionCoordinator, RemoteBackend,
    Settings,
};
use clusterform_terraform::{Terraform, TerraformProvisioner};
use colored::Colorize;
use serde_json::Value;
use std::time::Duration;

pub type Coordinator = ProvisionCoordinator<Box<dyn Backend>, TerraformProvisioner>;

/// Parse repeated `--set key=value` arguments
///
/// Values that parse as JSON keep their type (`3`, `true`, `["a"]`); anything
/// else is taken as a string.
pub fn parse_settings(pairs: &[String]) -> anyhow::Result<Settings> {
    let mut settings = Settings::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid --set '{}': expected KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Invalid --set '{}': empty key", pair);
        }
        let value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        settings.insert(key.to_string(), value);
    }
    Ok(settings)
}

/// Backend selected by configuration
pub fn build_backend(config: &Config) -> Box<dyn Backend> {
    let stale_after = config.lock_stale_after_secs.map(Duration::from_secs);
    match &config.backend {
        BackendSettings::Local { path } => {
            tracing::debug!("Using local state in {}", path.display());
            let backend = LocalBackend::new(path);
            Box::new(match stale_after {
                Some(age) => backend.with_stale_after(age),
                None => backend,
            })
        }
        BackendSettings::Remote { url, prefix, token } => {
            tracing::debug!("Using remote state at {}", url);
            let store = HttpObjectStore::new(url.clone(), token.clone());
            let backend = RemoteBackend::new(store, prefix.clone());
            Box::new(match stale_after {
                Some(age) => backend.with_stale_after(age),
                None => backend,
            })
        }
    }
}

pub fn build_terraform(config: &Config) -> Terraform {
    let terraform = match &config.terraform_binary {
        Some(binary) => Terraform::new(binary.clone()),
        None => Terraform::default(),
    };
    config
        .terraform_env
        .iter()
        .fold(terraform, |terraform, (key, value)| {
            terraform.env(key.clone(), value.clone())
        })
}

pub fn build_coordinator(config: &Config) -> Coordinator {
    ProvisionCoordinator::new(
        build_backend(config),
        TerraformProvisioner::new(build_terraform(config)),
    )
}

pub fn module_sources(config: &Config) -> ModuleSources {
    config
        .source_url
        .as_deref()
        .map(ModuleSources::new)
        .unwrap_or_default()
}

/// Print a list of module names under a heading
pub fn print_modules(heading: &str, names: &[String]) {
    println!("{}", format!("{} ({}):", heading, names.len()).bold());
    for name in names {
        println!("  • {}", name.cyan());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[&str]) -> Vec<String> {
        pairs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_settings_types() {
        let settings = parse_settings(&args(&[
            "triton_account=ops",
            "master_count=3",
            "ha=true",
            "triton_network_names=[\"Joyent-SDC-Public\"]",
            "rancher_host_labels={\"compute\":\"true\"}",
            "empty=",
            "url=http://a.example.com/?x=1",
        ]))
        .unwrap();

        assert_eq!(settings["triton_account"], json!("ops"));
        assert_eq!(settings["master_count"], json!(3));
        assert_eq!(settings["ha"], json!(true));
        assert_eq!(settings["triton_network_names"], json!(["Joyent-SDC-Public"]));
        assert_eq!(settings["rancher_host_labels"]["compute"], json!("true"));
        assert_eq!(settings["empty"], json!(""));
        assert_eq!(settings["url"], json!("http://a.example.com/?x=1"));
    }

    #[test]
    fn test_parse_settings_errors() {
        assert!(parse_settings(&args(&["novalue"])).is_err());
        assert!(parse_settings(&args(&["=value"])).is_err());
    }

    #[test]
    fn test_module_sources_from_config() {
        let config = Config {
            source_url: Some("github.com/example/fork".to_string()),
            ..Config::default()
        };
        assert_eq!(module_sources(&config).base_url(), "github.com/example/fork");
        assert_eq!(
            module_sources(&Config::default()).base_url(),
            "github.com/joyent/triton-kubernetes"
        );
    }

    #[test]
    fn test_build_terraform_from_config() {
        let mut config = Config {
            terraform_binary: Some("/opt/terraform".to_string()),
            ..Config::default()
        };
        config.terraform_env.insert("TF_LOG".to_string(), "WARN".to_string());
        assert_eq!(build_terraform(&config).binary(), "/opt/terraform");
        assert_eq!(build_backend(&config).name(), "local");
    }
}
