pub mod commands;
pub mod config;
pub mod device;
pub mod devices;
pub mod ws_handler;
