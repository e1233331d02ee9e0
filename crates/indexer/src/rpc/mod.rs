//! RPC access layer.
//!
//! All node traffic funnels through [`ThrottledClient`], which caps global
//! concurrency with a fair permit gate so bursty components cannot starve
//! the trackers. WebSocket subscriptions come from [`WsPool`], which
//! rotates connections to spread subscription load. [`CurrentBlockOracle`]
//! keeps a process-wide view of the chain head, and [`BlockMetaCache`]
//! memoizes block hash/timestamp lookups backed by storage.

pub mod block_cache;
pub mod oracle;
pub mod pool;
pub mod throttled;

pub use block_cache::BlockMetaCache;
pub use oracle::CurrentBlockOracle;
pub use pool::WsPool;
pub use throttled::{call_request, PermitGate, ThrottledClient};
