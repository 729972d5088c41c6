mod args;
mod driver;
mod proc;
mod progress;
mod types;
mod write;

pub use args::*;
pub use driver::{GlycoScreener, GlycoScreenerError};
pub use types::{CONFIG_FILE, ENV_PREFIX};
