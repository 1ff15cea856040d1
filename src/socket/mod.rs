//! Outbound TCP connections.
//!
//! - [`dial`]: the physical dial primitive, optionally protected from VPN routing
//! - [`retrier`]: split-retry streams that survive SNI-based blocking
//! - [`flag`]: one-shot flags shared by the stream halves

pub mod dial;
pub mod flag;
pub mod retrier;

pub use dial::{Dial, Dialing, Protect, ProtectedDialer, TcpDialer};
pub use flag::Flag;
pub use retrier::{
    dial_with_split_retry, split_hello, RetryStats, SplitRetryConfig, SplitRetryStream, MAX_HELLO_LEN,
};
