pub mod evaluator;
pub mod monitor;

pub use evaluator::evaluate;
pub use monitor::AlertMonitor;
