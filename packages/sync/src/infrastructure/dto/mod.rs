//! Data Transfer Objects (DTOs) for the sync core.
//!
//! - `websocket`: socket event DTOs
//! - `conversion`: DTO ⇄ domain conversions

pub mod conversion;
pub mod websocket;
