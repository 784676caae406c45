pub mod binary_resolver;
pub mod config;
