pub mod conf;
pub mod constants;
pub mod elevate;
pub mod errors;
pub mod firewall;
pub mod ipc;
pub mod manager;
pub mod process_log;
pub mod services;
pub mod tunnel;
pub mod updater;
