//! `gitplan serve`.

use anyhow::Result;
use gitplan::config::GitplanToml;

pub async fn cmd_serve(config: GitplanToml) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    gitplan::server::start_server(config).await
}
