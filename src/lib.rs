pub mod connection;
pub mod util;
