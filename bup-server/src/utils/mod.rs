pub mod cron;
pub mod format;
pub mod fs;
pub mod logger;
