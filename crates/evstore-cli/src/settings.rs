//! Global flags and how they fold into [`ConnectionSettings`].

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use evstore_core::{ConnectionSettings, EndPoint, UserCredentials};

const DEFAULT_ENDPOINT: &str = "127.0.0.1:1113";
const DEFAULT_HTTP_PORT: u16 = 2113;

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// TCP endpoint as host:port
    #[arg(long, global = true, env = "EVSTORE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Connection settings file; flags given alongside override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, env = "EVSTORE_USER")]
    pub user: Option<String>,

    #[arg(long, global = true, env = "EVSTORE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Connect over TLS, validating the server certificate
    #[arg(long, global = true)]
    pub tls: bool,
}

impl GlobalArgs {
    pub fn connection_settings(&self) -> anyhow::Result<ConnectionSettings> {
        let mut settings = match &self.config {
            Some(path) => ConnectionSettings::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ConnectionSettings::single_node(DEFAULT_ENDPOINT.parse()?),
        };

        if let Some(endpoint) = &self.endpoint {
            let endpoint: EndPoint = endpoint.parse().with_context(|| format!("invalid --endpoint {endpoint}"))?;
            settings.endpoint = Some(endpoint);
            settings.gossip = None;
        }
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => {
                settings = settings.with_default_credentials(UserCredentials::new(user.clone(), password.clone()));
            }
            (None, None) => {}
            _ => anyhow::bail!("--user and --password must be given together"),
        }
        if self.tls {
            settings = settings.with_tls(None, true);
        }
        settings = settings.with_connection_name("evstore-cli");

        settings.validate()?;
        Ok(settings)
    }

    /// HTTP endpoint for administrative calls.
    pub fn http_endpoint(&self, settings: &ConnectionSettings, flag: Option<&str>) -> anyhow::Result<EndPoint> {
        if let Some(raw) = flag {
            return raw.parse().with_context(|| format!("invalid --http-endpoint {raw}"));
        }
        let host = settings
            .endpoint
            .as_ref()
            .map(|e| e.host.clone())
            .context("no TCP endpoint to derive the HTTP endpoint from; pass --http-endpoint")?;
        Ok(EndPoint::new(host, DEFAULT_HTTP_PORT))
    }
}
