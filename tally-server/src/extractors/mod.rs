//! Extractors for types from the request.

mod client_ip;
mod signed_body;

pub use self::client_ip::*;
pub use self::signed_body::*;
