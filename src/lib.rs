//! Process-level wiring for the Guardian CONNECT-proxy broker: config
//! and decision-file I/O, the proxy listener, signal-triggered reload,
//! audit logging, and the loopback admin API. The policy/token/approval
//! domain model itself lives in `guardian_core`.

pub mod admin;
pub mod audit;
pub mod config;
pub mod decisions;
pub mod error;
pub mod proxy;
pub mod reload;
