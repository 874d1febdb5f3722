//! Application wiring and commands.

mod commands;
mod init;

pub use commands::{check, import, init_config, logout, status};
pub use init::run;
