use clusterform_config::Settings as Config;
use clusterform_state::LoadMode;

use crate::utils;

/// Print the whole document, or the value at a dotted path
pub async fn handle(config: &Config, manager: &str, path: Option<&str>) -> anyhow::Result<()> {
    let coordinator = utils::build_coordinator(config);
    let document = coordinator.load(manager, LoadMode::RequireExisting).await?;

    match path {
        None => println!("{}", String::from_utf8_lossy(&document.bytes()?)),
        Some(path) => match document.get(path) {
            Some(serde_json::Value::String(value)) => println!("{}", value),
            Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
            None => anyhow::bail!("'{}' is not set in {}", path, manager),
        },
    }

    Ok(())
}
