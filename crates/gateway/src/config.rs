//! Process configuration: everything read once at startup from the
//! environment, the teacher's `dotenvy` + `std::env::var` pattern. Per-sitekey
//! security policy is data (§3), not process config, and lives in Postgres —
//! see [`crate::db`].

use std::net::SocketAddr;

pub struct AppConfig {
    pub database_url: String,
    pub server_secret: Vec<u8>,
    pub bind_addr: SocketAddr,
    pub environment: String,
    pub allowed_origins_raw: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;
        let server_secret = std::env::var("SERVER_SECRET")
            .map_err(|_| anyhow::anyhow!("SERVER_SECRET environment variable is required"))?
            .into_bytes();
        if server_secret.len() < 32 {
            anyhow::bail!("SERVER_SECRET must be at least 32 bytes");
        }

        let port: u16 = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(9009);
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        let allowed_origins_raw = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string());

        Ok(Self { database_url, server_secret, bind_addr, environment, allowed_origins_raw })
    }
}
