pub mod classifier;
pub mod config;
pub mod error;
pub mod parser;
pub mod reader;
pub mod worker;
