//! # Engine Test Harness
//!
//! Builds an [`EngineModel`] wired to the in-memory collaborators and seeds
//! its configuration store. Shared by the integration tests under `tests/`.

use lib_archive::connections::memory::{
    MemoryAuditSink, MemoryConfigStore, MemorySampleSink, MemoryValueSource,
};
use lib_archive::core::{
    ChannelDescriptor, EngineDescriptor, EngineModel, EngineServices, EngineSettings, Enablement,
    GroupDescriptor, ValueSource,
};
use std::sync::Arc;
use std::time::Duration;

pub const ENGINE_NAME: &str = "main";
pub const ENGINE_ID: i64 = 1;
pub const ENGINE_PORT: u16 = 4812;

pub struct TestHarness {
    pub engine: Arc<EngineModel>,
    pub store: Arc<MemoryConfigStore>,
    pub sink: Arc<MemorySampleSink>,
    pub audit: Arc<MemoryAuditSink>,
    pub source: Arc<MemoryValueSource>,
}

impl TestHarness {
    /// Engine with default settings and the `main` engine seeded on port 4812.
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::build(settings, |source| source as Arc<dyn ValueSource>)
    }

    /// Lets the test put its own value source in front of the memory source.
    pub fn build(
        settings: EngineSettings,
        wrap_source: impl FnOnce(Arc<MemoryValueSource>) -> Arc<dyn ValueSource>,
    ) -> Self {
        let store = Arc::new(MemoryConfigStore::new());
        let sink = Arc::new(MemorySampleSink::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let source = Arc::new(MemoryValueSource::new());

        let engine = Arc::new(EngineModel::new(
            settings,
            EngineServices {
                config_store: store.clone(),
                sink: sink.clone(),
                audit: audit.clone(),
                source: wrap_source(source.clone()),
            },
        ));

        store.add_engine(EngineDescriptor {
            id: ENGINE_ID,
            name: ENGINE_NAME.to_string(),
            url: format!("http://localhost:{ENGINE_PORT}/{ENGINE_NAME}"),
        });

        Self {
            engine,
            store,
            sink,
            audit,
            source,
        }
    }

    pub fn add_group(&self, id: i64, name: &str) {
        self.store.add_group(
            ENGINE_ID,
            GroupDescriptor {
                id,
                name: name.to_string(),
            },
        );
    }

    pub fn add_channel(&self, group_id: i64, channel: ChannelDescriptor) {
        self.store.add_channel(group_id, channel);
    }

    /// `read_config` against the seeded engine, then `start`.
    pub async fn configure_and_start(&self) {
        self.engine
            .read_config(ENGINE_NAME, ENGINE_PORT)
            .await
            .expect("read_config failed");
        self.engine.start().await.expect("start failed");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn monitor(id: i64, name: &str) -> ChannelDescriptor {
    ChannelDescriptor {
        id,
        name: name.to_string(),
        sample_mode: "monitor".to_string(),
        sample_value: 0.0,
        sample_period: 1.0,
        last_archived_time: None,
        enablement: Enablement::Passive,
    }
}

pub fn delta(id: i64, name: &str, threshold: f64) -> ChannelDescriptor {
    ChannelDescriptor {
        sample_value: threshold,
        ..monitor(id, name)
    }
}

pub fn scan(id: i64, name: &str, period_secs: f64) -> ChannelDescriptor {
    ChannelDescriptor {
        sample_mode: "scan".to_string(),
        sample_period: period_secs,
        ..monitor(id, name)
    }
}

/// Polls `done` until it holds, panicking after five seconds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
