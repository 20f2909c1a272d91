//! `ols config`: show the environment-derived configuration.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use ols_core::{Config, Mode};

const REDACTED: &str = "<redacted>";

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled, Serialize)]
struct Setting {
    #[tabled(rename = "setting")]
    name: &'static str,
    #[tabled(rename = "value")]
    value: String,
}

impl ConfigArgs {
    pub fn run(self) -> Result<()> {
        let config = Config::from_env().context("invalid configuration")?;
        let settings = settings(&config);

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&settings).context("failed to serialize config")?
            );
            return Ok(());
        }

        let mut table = Table::new(settings);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn settings(config: &Config) -> Vec<Setting> {
    let mut rows = Vec::new();
    let mut push = |name, value: String| rows.push(Setting { name, value });

    match &config.mode {
        Mode::Development { dir } => {
            push("mode", "dev".into());
            push("dev dir", dir.display().to_string());
        }
        Mode::Production {
            repository,
            mirror_dir,
        } => {
            push("mode", "production".into());
            push("repository", repository.clone());
            push("mirror dir", mirror_dir.display().to_string());
        }
    }
    push("branch", config.branch.clone());
    push("workers dir", config.workers_dir().display().to_string());
    push("instance", config.author_name().to_string());
    push(
        "api key",
        config
            .api_key
            .as_ref()
            .map_or_else(|| "(disabled)".to_string(), |_| REDACTED.to_string()),
    );
    push(
        "polling interval",
        format!("{}s", config.polling_interval.as_secs()),
    );
    push("listen", config.listen.to_string());
    push("runner", config.runner.join(" "));
    push("memory limit", format!("{} MB", config.limits.memory_limit_mb));
    push(
        "wall clock limit",
        format!("{} ms", config.limits.wall_clock_timeout.as_millis()),
    );
    push(
        "cpu limits",
        format!(
            "{} ms soft / {} ms hard",
            config.limits.cpu_time_soft_limit.as_millis(),
            config.limits.cpu_time_hard_limit.as_millis()
        ),
    );
    rows
}
