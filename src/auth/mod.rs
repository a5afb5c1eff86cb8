//! Coordinator authentication (spec.md §4.1 `AuthTokenCache`).

pub mod token_cache;

pub use token_cache::{AuthError, AuthResult, AuthToken, AuthTokenCache};
