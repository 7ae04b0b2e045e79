// ABOUTME: Connector - builds a fresh source/sink pair for each sync run
// ABOUTME: Adapters are created inside the worker thread and never shared between runs

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::SyncConfig;
use crate::sink::{ClickHouseSink, MemorySink, SinkAdapter};
use crate::source::{MemorySource, PostgresSource, SourceAdapter};

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_source(&self) -> Result<Box<dyn SourceAdapter>>;
    async fn connect_sink(&self) -> Result<Box<dyn SinkAdapter>>;
}

/// PostgreSQL source, ClickHouse sink.
pub struct PostgresClickHouseConnector {
    config: SyncConfig,
}

impl PostgresClickHouseConnector {
    pub fn new(config: SyncConfig) -> Result<Self> {
        if config.source.url.is_none() {
            anyhow::bail!("source.url is not configured");
        }
        if config.sink.url.is_none() {
            anyhow::bail!("sink.url is not configured");
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Connector for PostgresClickHouseConnector {
    async fn connect_source(&self) -> Result<Box<dyn SourceAdapter>> {
        let url = self
            .config
            .source
            .url
            .as_deref()
            .context("source.url is not configured")?;
        Ok(Box::new(PostgresSource::connect(url).await?))
    }

    async fn connect_sink(&self) -> Result<Box<dyn SinkAdapter>> {
        Ok(Box::new(ClickHouseSink::new(&self.config.sink)?))
    }
}

/// In-process adapters sharing data with the handles given here.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    pub source: MemorySource,
    pub sink: MemorySink,
}

impl MemoryConnector {
    pub fn new(source: MemorySource, sink: MemorySink) -> Self {
        Self { source, sink }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect_source(&self) -> Result<Box<dyn SourceAdapter>> {
        Ok(Box::new(self.source.fresh()))
    }

    async fn connect_sink(&self) -> Result<Box<dyn SinkAdapter>> {
        Ok(Box::new(self.sink.clone()))
    }
}
