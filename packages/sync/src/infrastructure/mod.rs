pub mod dto;
pub mod http;
pub mod transport;
