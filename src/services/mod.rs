pub mod calendar;
pub mod init;
pub mod notifications;
pub mod permission;
pub mod platform;
pub mod proxy;
pub mod scheduler;
