pub mod backup_engine;
pub mod command_runner;
pub mod concurrency;
pub mod manifest;
pub mod rclone;
pub mod repository_config;
pub mod restic;
pub mod restore;
pub mod schedule;
pub mod secrets;
pub mod user_fs;
