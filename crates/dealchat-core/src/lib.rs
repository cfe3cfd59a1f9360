pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DealchatConfig;
pub use error::{DealchatError, Result};
pub use types::*;
