//! API server configuration

use std::net::SocketAddr;

use anyhow::Context;

/// Shortest operator token accepted at startup
const MIN_OPERATOR_TOKEN_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: SocketAddr,
    /// Shared secret presented by the admin back office
    pub operator_api_token: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let bind_address = std::env::var("BIND_ADDRESS")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("BIND_ADDRESS must be host:port")?;

        let operator_api_token =
            std::env::var("OPERATOR_API_TOKEN").context("OPERATOR_API_TOKEN must be set")?;
        if operator_api_token.len() < MIN_OPERATOR_TOKEN_LEN {
            anyhow::bail!(
                "OPERATOR_API_TOKEN must be at least {} characters",
                MIN_OPERATOR_TOKEN_LEN
            );
        }

        Ok(Self {
            database_url,
            bind_address,
            operator_api_token,
        })
    }
}
