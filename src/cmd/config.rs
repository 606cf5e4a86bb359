//! Configuration view and validation commands (`leadflow config`).

use anyhow::Result;

use leadflow::config::LeadflowToml;

use super::super::ConfigCommands;

fn print_config(toml: &LeadflowToml) {
    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!("  db_path = \"{}\"", toml.server.db_path.display());
    println!("  dev_mode = {}", toml.server.dev_mode);
    println!();

    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  format = \"{}\"", toml.logging.format);
    if let Some(dir) = &toml.logging.directory {
        println!("  directory = \"{}\"", dir.display());
    }
    println!();

    let rules = &toml.incentives;
    println!("[incentives]");
    println!("  commission_bps = {}", rules.commission_bps);
    println!("  review_min_count = {}", rules.review_min_count);
    println!("  review_bonus_per_review = {}", rules.review_bonus_per_review);
    println!("  negative_review_penalty = {}", rules.negative_review_penalty);
    println!("  refund_penalty_bps = {}", rules.refund_penalty_bps);
    match rules.monthly_cap {
        Some(cap) => println!("  monthly_cap = {}", cap),
        None => println!("  monthly_cap = (uncapped)"),
    }
    for tier in &rules.streak_tiers {
        println!(
            "  streak tier: {} days -> {} bps",
            tier.min_days, tier.bonus_bps
        );
    }
    println!();
}

pub fn cmd_config(config_path: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Leadflow Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_config(&LeadflowToml::load(config_path)?);

                let mut effective = LeadflowToml::load(config_path)?;
                effective.apply_process_env()?;
                println!("Effective values (with env overrides):");
                println!("  host = \"{}\"", effective.server.host);
                println!("  port = {}", effective.server.port);
                println!("  db_path = \"{}\"", effective.server.db_path.display());
                println!("  log format = \"{}\"", effective.logging.format);
                println!();
            } else {
                println!("No leadflow.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                println!();
                print_config(&LeadflowToml::default());
                println!("Run 'leadflow config init' to create a leadflow.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No leadflow.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = LeadflowToml::load(config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("leadflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            LeadflowToml::default().save(config_path)?;

            println!("Created leadflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path, dev_mode");
            println!("  - [logging] level, format, directory");
            println!("  - [incentives] default commission and bonus rules");
            println!();
        }
    }

    Ok(())
}
