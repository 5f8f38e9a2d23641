//! Pure, deterministic logic: state keys, step ordering, secret decoding.

pub mod keys;
pub mod plan;
pub mod secret;
pub mod types;
