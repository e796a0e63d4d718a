/// Bulk directory transfer over multiple parallel TCP connections.
///
/// - Receiver binds N ports and accepts one connection per port
/// - Sender splits the source tree into blocks and spreads them over all
///   connections through a shared queue
/// - Per-port accept/dial retry and timeout policy
/// - Optional aggregate throttling (token bucket shared by all connections)
/// - At most one transfer per identity and destination at a time
/// - Worst-error-wins aggregation into one terminal `TransferReport`

pub mod error;
pub mod guard;
pub mod logging;
pub mod options;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod report;
pub mod request;
pub mod sender;
pub mod source;
pub mod throttler;
pub mod wdt;

// Re-export key types for convenience.
pub use error::{ErrorCode, Result, WdtError};
pub use guard::{ConcurrencyGuard, GuardTicket};
pub use logging::{NullLogger, TracingLogger, TransferLogger};
pub use options::WdtOptions;
pub use pool::{ConnectionState, RetryPolicy};
pub use progress::{LogProgressReporter, ProgressReporter, ProgressSnapshot};
pub use receiver::{Receiver, ReceiverState};
pub use report::{TransferReport, TransferStats};
pub use request::TransferRequest;
pub use sender::{Sender, SenderState};
pub use throttler::Throttler;
pub use wdt::Wdt;
