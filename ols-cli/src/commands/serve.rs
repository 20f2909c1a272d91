//! `ols serve`: run the router in the foreground.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Args;

use ols_core::Config;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address; overrides OLS_LISTEN.
    #[arg(long)]
    pub listen: Option<SocketAddr>,
}

impl ServeArgs {
    pub fn run(self) -> Result<()> {
        let mut config = Config::from_env().context("invalid configuration")?;
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        ols_daemon::start_blocking(config).context("daemon exited with error")?;
        Ok(())
    }
}
