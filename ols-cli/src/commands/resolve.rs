//! `ols resolve`: offline view of request routing.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::json;

use ols_core::Config;
use ols_daemon::ServiceResolver;

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Request path, e.g. `/hello?name=Alice`.
    pub path: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ResolveArgs {
    pub fn run(self) -> Result<()> {
        let config = Config::from_env().context("invalid configuration")?;
        let resolver = ServiceResolver::new(config.workers_dir());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start runtime")?;
        let (service, import_map) = runtime.block_on(async {
            let service = resolver.resolve(&self.path).await?;
            let import_map = resolver.locate_import_map(&service.directory_path).await;
            Ok::<_, ols_daemon::ResolveError>((service, import_map))
        })
        .with_context(|| format!("cannot route {}", self.path))?;

        if self.json {
            let payload = json!({
                "service": service.name,
                "directory": service.directory_path,
                "entry_point": service.entry_point_path,
                "import_map": import_map,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to render JSON")?
            );
            return Ok(());
        }

        println!("{} {}", "service".bold(), service.name);
        println!("{} {}", "directory".bold(), service.directory_path.display());
        println!("{} {}", "entry point".bold(), service.entry_point_path.display());
        match import_map {
            Some(path) => println!("{} {}", "import map".bold(), path.display()),
            None => println!("{} {}", "import map".bold(), "none".bright_black()),
        }
        Ok(())
    }
}
