pub mod classifier;
pub mod config;
pub mod error;
pub mod memory;
pub mod relay;

pub use classifier::{Destination, Verdict, classify, evaluate, verdict};
pub use config::RelayConfig;
pub use error::RelayError;
pub use relay::{Relay, RelayState, RelayStats};
