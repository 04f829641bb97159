pub mod connection;
pub mod messages;

pub use connection::LiveTickerStream;
