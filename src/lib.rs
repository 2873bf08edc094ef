pub mod hex;
pub mod transport;
