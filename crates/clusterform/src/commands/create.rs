use crate::CreateCommands;
use crate::utils;
use clusterform_config::Settings as Config;
use clusterform_state::{ClusterRequest, LoadMode, ManagerRequest, NodeRequest, StateError};
use colored::Colorize;

pub async fn handle(command: CreateCommands, config: &Config) -> anyhow::Result<()> {
    let coordinator = utils::build_coordinator(config);
    let sources = utils::module_sources(config);

    match command {
        CreateCommands::Manager {
            name,
            provider,
            set,
        } => {
            let request = ManagerRequest {
                name: name.clone(),
                provider,
                settings: utils::parse_settings(&set)?,
            };
            println!(
                "{}",
                format!("Creating cluster manager {} on {}...", name, provider).yellow()
            );
            let outcome = coordinator
                .apply(&name, LoadMode::CreateIfMissing, |document| {
                    if document.manager().is_some() {
                        return Err(StateError::InvalidInput(format!(
                            "cluster manager '{}' already exists",
                            name
                        )));
                    }
                    request.apply_to(document, &sources)
                })
                .await?;
            println!("{} {}", "✓".green(), outcome.value.cyan());
        }
        CreateCommands::Cluster {
            manager,
            name,
            provider,
            set,
        } => {
            let request = ClusterRequest {
                name: name.clone(),
                provider,
                settings: utils::parse_settings(&set)?,
            };
            println!(
                "{}",
                format!("Creating cluster {} in {}...", name, manager).yellow()
            );
            let outcome = coordinator
                .apply(&manager, LoadMode::RequireExisting, |document| {
                    request.apply_to(document, &sources)
                })
                .await?;
            println!("{} {}", "✓".green(), outcome.value.cyan());
        }
        CreateCommands::Node {
            manager,
            cluster,
            hostname,
            count,
            provider,
            set,
        } => {
            let request = NodeRequest {
                cluster: cluster.clone(),
                provider,
                hostname,
                count,
                settings: utils::parse_settings(&set)?,
            };
            println!(
                "{}",
                format!("Adding {} node(s) to {} in {}...", count, cluster, manager).yellow()
            );
            let outcome = coordinator
                .apply(&manager, LoadMode::RequireExisting, |document| {
                    request.apply_to(document, &sources)
                })
                .await?;
            utils::print_modules("Nodes created", &outcome.value);
        }
    }

    Ok(())
}
