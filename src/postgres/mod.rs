// ABOUTME: PostgreSQL connectivity for the sync source
// ABOUTME: TLS policy is initialized once per process, connections retry with backoff

pub mod connection;

pub use connection::{connect, connect_with_retry, init_tls_policy};
