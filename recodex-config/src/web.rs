//! HTTP listener settings.

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct WebConfig {
    /// HTTP listen port
    #[arg(long = "web-port", env = "RECODEX_WEB_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Bearer token protecting the REST API and websocket
    #[arg(long = "web-token", env = "RECODEX_WEB_TOKEN", default_value = "admin")]
    pub token: String,
}
