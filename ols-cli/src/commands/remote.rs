//! `ols status` / `ols update`: calls against a running instance.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::Value;

const DEFAULT_URL: &str = "http://127.0.0.1:9000";

#[derive(Args, Debug)]
pub struct RemoteArgs {
    /// Base URL of the instance.
    #[arg(long, default_value = DEFAULT_URL)]
    pub url: String,

    /// Value of OLS_API_KEY on the instance.
    #[arg(long)]
    pub key: String,
}

#[derive(Debug, Clone, Copy)]
pub enum RemoteCall {
    Status,
    Update,
}

impl RemoteCall {
    fn method(self) -> &'static str {
        match self {
            RemoteCall::Status => "status",
            RemoteCall::Update => "update",
        }
    }
}

impl RemoteArgs {
    pub fn run(self, call: RemoteCall) -> Result<()> {
        let url = api_url(&self.url, call);
        let request = match call {
            RemoteCall::Status => ureq::get(&url),
            RemoteCall::Update => ureq::post(&url),
        };

        let response = match request.query("key", &self.key).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                bail!("{} returned {code}: {}", call.method(), body.trim());
            }
            Err(err) => return Err(err).with_context(|| format!("failed to reach {}", self.url)),
        };

        let payload: Value = response
            .into_json()
            .with_context(|| format!("{} returned invalid JSON", call.method()))?;
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to render response JSON")?
        );
        Ok(())
    }
}

fn api_url(base: &str, call: RemoteCall) -> String {
    format!("{}/_internal/api/{}", base.trim_end_matches('/'), call.method())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_ignores_trailing_slash() {
        assert_eq!(
            api_url("http://edge:9000/", RemoteCall::Status),
            "http://edge:9000/_internal/api/status"
        );
        assert_eq!(
            api_url("http://edge:9000", RemoteCall::Update),
            "http://edge:9000/_internal/api/update"
        );
    }
}
