pub mod api;
pub mod cache;
pub mod config;
pub mod entity;
pub mod field;
pub mod pool;
pub mod query;
pub mod record;
pub mod runner;
pub mod sink;
pub mod system;
pub mod task;
pub mod totals;

#[cfg(test)]
mod testing;

pub use api::{HttpRestApi, RemoteError, RestApi};
pub use cache::{CacheKey, LookupCache};
pub use config::{ConfigError, LoaderConfig};
pub use entity::{Entity, EntityRegistry, EntitySchema};
pub use runner::{CsvRowSource, ProcessRunner, RowSource, RunSummary};
pub use sink::{CsvResultSink, ResultPaths, ResultSink, RowResult};
pub use task::Command;
pub use totals::{Action, TotalsSnapshot};
