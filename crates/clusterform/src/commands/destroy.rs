use crate::DestroyCommands;
use crate::utils;
use clusterform_config::Settings as Config;
use clusterform_state::workflow;
use colored::Colorize;

pub async fn handle(command: DestroyCommands, config: &Config) -> anyhow::Result<()> {
    let coordinator = utils::build_coordinator(config);

    let outcome = match command {
        DestroyCommands::Manager { manager } => {
            println!(
                "{}",
                format!("Destroying cluster manager {}...", manager).yellow()
            );
            coordinator.destroy_target(&manager).await?
        }
        DestroyCommands::Cluster { manager, name } => {
            println!(
                "{}",
                format!("Destroying cluster {} in {}...", name, manager).yellow()
            );
            coordinator
                .destroy_modules(&manager, |document| {
                    workflow::select_cluster(document, &name)
                })
                .await?
        }
        DestroyCommands::Node {
            manager,
            cluster,
            hostnames,
        } => {
            println!(
                "{}",
                format!("Destroying {} node(s) of {}...", hostnames.len(), cluster).yellow()
            );
            coordinator
                .destroy_modules(&manager, |document| {
                    workflow::select_nodes(document, &cluster, &hostnames)
                })
                .await?
        }
    };

    utils::print_modules("Destroyed", &outcome.value);
    Ok(())
}
