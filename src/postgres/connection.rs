// ABOUTME: Connection helpers for PostgreSQL with native TLS
// ABOUTME: init_tls_policy is idempotent; the first call wins

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the process-wide TLS policy.
///
/// Call once at startup. Later calls are ignored and the first value is kept,
/// so libraries embedding the engine can call it defensively.
pub fn init_tls_policy(allow_self_signed: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed).is_err() {
        tracing::debug!("TLS policy already initialized; ignoring new value");
    }
}

fn allow_self_signed() -> bool {
    *ALLOW_SELF_SIGNED.get_or_init(|| false)
}

/// Connect to PostgreSQL, spawning the connection driver on the current runtime.
pub async fn connect(url: &str) -> Result<Client> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed())
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls).await.with_context(|| {
        format!(
            "Failed to connect to {}",
            crate::utils::sanitize_url(url)
        )
    })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with 3 retries and exponential backoff starting at 1s.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    crate::utils::retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tls_policy_first_call_wins() {
        init_tls_policy(false);
        init_tls_policy(true);
        assert!(!allow_self_signed());
    }
}
