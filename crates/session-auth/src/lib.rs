//! Credential lifecycle for a bearer-token JSON API
//!
//! Holds the access/refresh token pair for one API session, persists the
//! refresh token through a pluggable key-value store, and fans out
//! authentication-state changes to observers. This crate performs no request
//! orchestration; `session-client` builds single-flight refresh and the
//! retry-on-401 protocol on top of it.
//!
//! Credential flow:
//! 1. Host calls `token::login()` (or an OIDC callback obtains tokens)
//! 2. Tokens handed to `TokenStore::set()`, refresh token persisted
//! 3. Observers registered with `SubscriberRegistry::on_change()` see `true`
//! 4. `token::refresh_token()` mints a new access token when the old one lapses
//! 5. `TokenStore::clear()` on logout or refresh failure, observers see `false`

pub mod constants;
pub mod error;
pub mod storage;
pub mod subscribers;
pub mod token;
pub mod token_store;

pub use constants::*;
pub use error::{Error, Result};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use subscribers::{SubscriberRegistry, Subscription};
pub use token::{TokenResponse, login, refresh_token};
pub use token_store::TokenStore;
