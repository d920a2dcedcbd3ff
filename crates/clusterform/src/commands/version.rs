use clusterform_config::Settings as Config;
use colored::Colorize;

use crate::utils;

pub async fn handle(config: &Config) {
    println!("clusterform {}", env!("CARGO_PKG_VERSION"));

    let terraform = utils::build_terraform(config);
    match terraform.version().await {
        Ok(version) => println!("{}", version),
        Err(e) => {
            tracing::debug!("terraform version check failed: {}", e);
            println!(
                "{} {}",
                "terraform not available:".yellow(),
                terraform.binary()
            );
        }
    }
}
