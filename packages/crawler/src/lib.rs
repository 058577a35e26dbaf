//! URL frontier, fetch worker pool, and crawl execution runtime for the
//! intake orchestration core.
//!
//! The scheduler package decides WHEN a job runs; this package does the
//! running: deduplicated per-host URL queueing with politeness, bounded
//! concurrent fetching with robots.txt and redirect discipline, selector
//! extraction with a readability fallback, and canonical-record emission.

pub mod error;
pub mod execution;
pub mod extract;
pub mod fetcher;
pub mod frontier;
pub mod robots;
pub mod sink;
pub mod source;
pub mod testing;
pub mod urlnorm;

pub use error::{CrawlError, FailureBucket, FetchError, Result};
pub use execution::{preview_crawl, ExecutionRuntime, RuntimeConfig};
pub use extract::{extract_links, CanonicalRecord, Extracted, Extractor, RecordQuality, SelectorSet};
pub use fetcher::{FetchConfig, FetchPool, FetchedPage, HttpFetcher, PageFetcher};
pub use frontier::{
    DiscoveredLink, Frontier, FrontierConfig, FrontierEntry, FrontierEntryId, FrontierStatus,
    FrontierStore, MemoryFrontierStore, PostgresFrontierStore, Submitted,
};
pub use robots::{RobotsCache, RobotsTxt};
pub use sink::{BlobStore, ContentSink, HttpContentSink, MemoryBlobStore, MemorySink, SinkError};
pub use source::{HttpSourceProvider, SourceConfig, SourceProvider, StaticSourceProvider};
pub use urlnorm::{canonicalize, url_hash, ContentHash};
