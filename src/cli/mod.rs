pub mod commands;
pub mod shell;
