//! Holder-count acquisition: the JSON-RPC client with its retry policy, the
//! single-flight fetcher over the shared cache, the background refresher and
//! the console monitor loop. The API process embeds all of it in-process so
//! both surfaces share one cache.

pub mod fetcher;
pub mod refresher;
pub mod rpc;
pub mod stats;
pub mod worker;

#[cfg(test)]
mod testing;

pub use fetcher::{Fetched, HolderFetcher, Lookup, LookupError, RefreshOutcome};
pub use refresher::{RefreshReport, Refresher};
pub use rpc::{count_holders, FetchError, HolderSource, RetryPolicy, RpcHolderSource};
pub use stats::{render_summary, MonitorMetrics};
pub use worker::{MonitorError, MonitorLoop};
