//! Configuration, paths, and logging shared by the entitlement sync crates.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, PollConfig, DEFAULT_SUPABASE_PUBLISHABLE_KEY, DEFAULT_SUPABASE_URL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
