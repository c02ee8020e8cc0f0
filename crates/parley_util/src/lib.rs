#![forbid(unsafe_code)]

pub mod endpoint;
pub mod secret;

pub use endpoint::QuicEndpoint;
pub use secret::SecretString;
