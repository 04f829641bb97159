pub mod ticker_store;

pub use ticker_store::TickerStore;
