pub mod btle;
pub mod channel;
pub mod constants;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod types;
