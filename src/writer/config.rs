use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analysis::{Analyzer, StandardAnalyzer};
use crate::error::{IrisError, Result};
use crate::writer::chain::IndexingChainFactory;
use crate::writer::flush_policy::{FlushByRamOrCountsPolicy, FlushPolicy};
use crate::writer::inverted_chain::InvertedChainFactory;

/// Default RAM buffer size in MB.
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;

/// Default per-buffer hard limit in MB.
pub const DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB: u64 = 1945;

/// Default maximum number of documents in one index.
pub const DEFAULT_MAX_DOCS: u64 = i32::MAX as u64 - 128;

/// Default maximum term length in bytes.
pub const DEFAULT_MAX_TERM_LENGTH: usize = 16383;

fn default_ram_buffer_size_mb() -> Option<f64> {
    Some(DEFAULT_RAM_BUFFER_SIZE_MB)
}

fn default_ram_per_thread_hard_limit_mb() -> u64 {
    DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB
}

fn default_true() -> bool {
    true
}

fn default_max_docs() -> u64 {
    DEFAULT_MAX_DOCS
}

fn default_segment_prefix() -> String {
    "segment".to_string()
}

fn default_max_term_length() -> usize {
    DEFAULT_MAX_TERM_LENGTH
}

/// Configuration for the index writer and its ingestion core.
#[derive(Clone, Serialize, Deserialize)]
pub struct IndexWriterConfig {
    /// RAM all buffers may use before the largest one is flushed; `None`
    /// disables flushing by RAM.
    #[serde(default = "default_ram_buffer_size_mb")]
    pub ram_buffer_size_mb: Option<f64>,

    /// Documents one buffer may hold before it is flushed; `None` disables
    /// flushing by document count.
    #[serde(default)]
    pub max_buffered_docs: Option<usize>,

    /// RAM a single buffer may use before it is flushed regardless of the
    /// flush policy.
    #[serde(default = "default_ram_per_thread_hard_limit_mb")]
    pub ram_per_thread_hard_limit_mb: u64,

    /// Let indexing threads help with pending flushes on every update.
    #[serde(default = "default_true")]
    pub check_pending_flush_on_update: bool,

    /// Pack flushed segments into compound files.
    #[serde(default = "default_true")]
    pub use_compound_file: bool,

    /// Maximum number of documents in the index.
    #[serde(default = "default_max_docs")]
    pub max_docs: u64,

    /// Prefix of generated segment names.
    #[serde(default = "default_segment_prefix")]
    pub segment_prefix: String,

    /// Longest term the default chain accepts, in bytes.
    #[serde(default = "default_max_term_length")]
    pub max_term_length: usize,

    /// Custom flush policy (not serialized).
    #[serde(skip)]
    pub flush_policy: Option<Arc<dyn FlushPolicy>>,

    /// Analyzer of the default chain (not serialized).
    #[serde(skip)]
    pub analyzer: Option<Arc<dyn Analyzer>>,

    /// Custom indexing chain factory (not serialized).
    #[serde(skip)]
    pub chain_factory: Option<Arc<dyn IndexingChainFactory>>,
}

impl IndexWriterConfig {
    pub fn builder() -> IndexWriterConfigBuilder {
        IndexWriterConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(mb) = self.ram_buffer_size_mb
            && !(mb > 0.0 && mb.is_finite())
        {
            return Err(IrisError::invalid_config(format!(
                "ram_buffer_size_mb must be positive, got {mb}"
            )));
        }
        if self.max_buffered_docs == Some(0) {
            return Err(IrisError::invalid_config(
                "max_buffered_docs must be at least 1",
            ));
        }
        if self.ram_buffer_size_mb.is_none() && self.max_buffered_docs.is_none() {
            return Err(IrisError::invalid_config(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be enabled",
            ));
        }
        if self.ram_per_thread_hard_limit_mb == 0 || self.ram_per_thread_hard_limit_mb >= 2048 {
            return Err(IrisError::invalid_config(format!(
                "ram_per_thread_hard_limit_mb must be in 1..2048, got {}",
                self.ram_per_thread_hard_limit_mb
            )));
        }
        if self.max_docs == 0 || self.max_docs > DEFAULT_MAX_DOCS {
            return Err(IrisError::invalid_config(format!(
                "max_docs must be in 1..={DEFAULT_MAX_DOCS}, got {}",
                self.max_docs
            )));
        }
        if self.segment_prefix.is_empty() {
            return Err(IrisError::invalid_config("segment_prefix must not be empty"));
        }
        if self.max_term_length == 0 {
            return Err(IrisError::invalid_config("max_term_length must be positive"));
        }
        Ok(())
    }

    /// The configured flush policy, or one derived from the flush triggers.
    pub fn flush_policy_or_default(&self) -> Arc<dyn FlushPolicy> {
        self.flush_policy.clone().unwrap_or_else(|| {
            Arc::new(FlushByRamOrCountsPolicy::new(
                self.ram_buffer_size_mb,
                self.max_buffered_docs,
            ))
        })
    }

    /// The configured chain factory, or the inverted chain with the
    /// configured analyzer.
    pub fn chain_factory_or_default(&self) -> Arc<dyn IndexingChainFactory> {
        self.chain_factory.clone().unwrap_or_else(|| {
            let analyzer = self
                .analyzer
                .clone()
                .unwrap_or_else(|| Arc::new(StandardAnalyzer::new()));
            Arc::new(InvertedChainFactory::new(analyzer, self.max_term_length))
        })
    }

    pub fn ram_per_thread_hard_limit_bytes(&self) -> i64 {
        (self.ram_per_thread_hard_limit_mb * 1024 * 1024) as i64
    }
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            ram_buffer_size_mb: default_ram_buffer_size_mb(),
            max_buffered_docs: None,
            ram_per_thread_hard_limit_mb: DEFAULT_RAM_PER_THREAD_HARD_LIMIT_MB,
            check_pending_flush_on_update: true,
            use_compound_file: true,
            max_docs: DEFAULT_MAX_DOCS,
            segment_prefix: default_segment_prefix(),
            max_term_length: DEFAULT_MAX_TERM_LENGTH,
            flush_policy: None,
            analyzer: None,
            chain_factory: None,
        }
    }
}

impl std::fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("ram_buffer_size_mb", &self.ram_buffer_size_mb)
            .field("max_buffered_docs", &self.max_buffered_docs)
            .field(
                "ram_per_thread_hard_limit_mb",
                &self.ram_per_thread_hard_limit_mb,
            )
            .field(
                "check_pending_flush_on_update",
                &self.check_pending_flush_on_update,
            )
            .field("use_compound_file", &self.use_compound_file)
            .field("max_docs", &self.max_docs)
            .field("segment_prefix", &self.segment_prefix)
            .field("max_term_length", &self.max_term_length)
            .field("flush_policy", &self.flush_policy)
            .field("analyzer", &self.analyzer.as_ref().map(|a| a.name()))
            .field("chain_factory", &self.chain_factory)
            .finish()
    }
}

/// Builder for [`IndexWriterConfig`].
#[derive(Default)]
pub struct IndexWriterConfigBuilder {
    config: IndexWriterConfig,
}

impl IndexWriterConfigBuilder {
    pub fn ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.config.ram_buffer_size_mb = mb;
        self
    }

    pub fn max_buffered_docs(mut self, docs: Option<usize>) -> Self {
        self.config.max_buffered_docs = docs;
        self
    }

    pub fn ram_per_thread_hard_limit_mb(mut self, mb: u64) -> Self {
        self.config.ram_per_thread_hard_limit_mb = mb;
        self
    }

    pub fn check_pending_flush_on_update(mut self, check: bool) -> Self {
        self.config.check_pending_flush_on_update = check;
        self
    }

    pub fn use_compound_file(mut self, use_compound_file: bool) -> Self {
        self.config.use_compound_file = use_compound_file;
        self
    }

    pub fn max_docs(mut self, max_docs: u64) -> Self {
        self.config.max_docs = max_docs;
        self
    }

    pub fn segment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.segment_prefix = prefix.into();
        self
    }

    pub fn max_term_length(mut self, length: usize) -> Self {
        self.config.max_term_length = length;
        self
    }

    pub fn flush_policy(mut self, policy: Arc<dyn FlushPolicy>) -> Self {
        self.config.flush_policy = Some(policy);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.config.analyzer = Some(analyzer);
        self
    }

    pub fn chain_factory(mut self, factory: Arc<dyn IndexingChainFactory>) -> Self {
        self.config.chain_factory = Some(factory);
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<IndexWriterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IndexWriterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ram_buffer_size_mb, Some(16.0));
        assert_eq!(config.max_buffered_docs, None);
        assert_eq!(config.max_docs, i32::MAX as u64 - 128);
    }

    #[test]
    fn test_some_flush_trigger_required() {
        let err = IndexWriterConfig::builder()
            .ram_buffer_size_mb(None)
            .build()
            .unwrap_err();
        assert!(matches!(err, IrisError::InvalidConfig(_)));

        let config = IndexWriterConfig::builder()
            .ram_buffer_size_mb(None)
            .max_buffered_docs(Some(10))
            .build()
            .unwrap();
        assert_eq!(config.max_buffered_docs, Some(10));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(IndexWriterConfig::builder().ram_buffer_size_mb(Some(-1.0)).build().is_err());
        assert!(IndexWriterConfig::builder().ram_per_thread_hard_limit_mb(2048).build().is_err());
        assert!(IndexWriterConfig::builder().max_docs(0).build().is_err());
        assert!(IndexWriterConfig::builder().segment_prefix("").build().is_err());
    }

    #[test]
    fn test_json_uses_defaults_for_missing_fields() {
        let config: IndexWriterConfig =
            serde_json::from_str(r#"{"max_buffered_docs": 100, "use_compound_file": false}"#).unwrap();
        assert_eq!(config.max_buffered_docs, Some(100));
        assert!(!config.use_compound_file);
        assert_eq!(config.ram_buffer_size_mb, Some(16.0));
        assert_eq!(config.segment_prefix, "segment");
        assert!(config.flush_policy.is_none());

        let json = serde_json::to_string(&config).unwrap();
        let back: IndexWriterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_buffered_docs, Some(100));
    }
}
