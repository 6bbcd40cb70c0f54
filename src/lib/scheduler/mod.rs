pub mod cron;
pub mod executor;
pub mod scheduler;
pub mod types;
pub mod window;
