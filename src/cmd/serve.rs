//! Server and database setup commands (`leadflow serve`, `leadflow init-db`).

use anyhow::Result;

use leadflow::config::LeadflowToml;
use leadflow::crm::server;

pub async fn cmd_serve(config: &LeadflowToml) -> Result<()> {
    config.check()?;
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    server::start_server(config.server_config()).await
}

pub fn cmd_init_db(db_path: &std::path::Path) -> Result<()> {
    server::open_database(db_path)?;
    println!("Leadflow database initialized at {}", db_path.display());
    Ok(())
}
