pub mod cli;
pub mod config;
pub mod registry;
pub mod runner;
pub mod sink;
pub mod source;
pub mod storage;
pub mod transform;
