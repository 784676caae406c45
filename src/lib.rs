pub mod driver;
pub mod parser;
pub mod report;
pub mod runner;
pub mod utils;
pub mod vision;

// Re-export common items
pub use driver::list_devices;
pub use report::generate_report;
pub use runner::run_tests;
