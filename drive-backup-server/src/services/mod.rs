pub mod backup_scheduler;
pub mod drive;
pub mod drive_auth;
pub mod ssh_host;
