//! Process startup: logging initialisation and startup banners

mod logger;
mod logging;

pub use logger::{display_startup_banner, StartupLogger};
pub use logging::init_logging;
