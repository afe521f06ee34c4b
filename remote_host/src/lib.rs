pub mod algorithms;
pub mod config;
pub mod session;
