//! HTTP interface of the relay
//!
//! Senders upload through `/upload`; receivers register, poll, download and
//! acknowledge through the remaining routes.

pub mod error;
pub mod handlers;
pub mod server;

pub use error::ApiError;
pub use server::{create_router, start_http_server};
