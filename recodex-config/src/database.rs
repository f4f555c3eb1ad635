//! Postgres connection settings for the server.

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct DatabaseConfig {
    /// Database host
    #[arg(long = "database-host", env = "RECODEX_DATABASE_HOST", default_value = "localhost")]
    pub host: String,

    /// Database port
    #[arg(long = "database-port", env = "RECODEX_DATABASE_PORT", default_value_t = 5432)]
    pub port: u16,

    /// Database user
    #[arg(long = "database-user", env = "RECODEX_DATABASE_USER", default_value = "postgres")]
    pub user: String,

    /// Database password
    #[arg(long = "database-password", env = "RECODEX_DATABASE_PASSWORD", default_value = "postgres")]
    pub password: String,

    /// Database name
    #[arg(long = "database-name", env = "RECODEX_DATABASE_NAME", default_value = "recodex")]
    pub database: String,

    /// Postgres sslmode
    #[arg(long = "database-sslmode", env = "RECODEX_DATABASE_SSLMODE", default_value = "disable")]
    pub ssl_mode: String,
}

impl DatabaseConfig {
    pub fn connect_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.database, self.ssl_mode
        )
    }
}
