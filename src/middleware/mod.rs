//! Request-scoped middleware: client address extraction and request IDs.

mod client_ip;
mod request_id;

pub use client_ip::extract_client_ip;
pub use request_id::{RequestId, request_id_middleware};
