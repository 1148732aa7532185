pub mod commands;
pub mod dispatch;
pub mod gateway;
pub mod reader;
pub mod session;
pub mod utils;
