pub mod config;
pub mod remote;
pub mod resolve;
pub mod serve;
