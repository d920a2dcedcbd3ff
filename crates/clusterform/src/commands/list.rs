use clusterform_config::Settings as Config;
use clusterform_state::Backend;
use colored::Colorize;

use crate::utils;

pub async fn handle(config: &Config) -> anyhow::Result<()> {
    let backend = utils::build_backend(config);
    let managers = backend.list().await?;

    if managers.is_empty() {
        println!("{}", "No cluster managers".dimmed());
        return Ok(());
    }

    utils::print_modules("Cluster managers", &managers);
    Ok(())
}
