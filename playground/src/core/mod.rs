pub mod outcome;
pub mod runtimes;
pub mod utils;
pub mod version;
