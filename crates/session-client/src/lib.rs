//! Authenticated request engine for a bearer-token JSON API
//!
//! A `Session` is the context object a host application creates at startup
//! and hands to every component that talks to the API. It owns:
//!
//! - the `TokenStore` (from `session-auth`) with the current credentials
//! - a `RefreshCoordinator` that keeps at most one refresh call in flight
//! - a `RequestExecutor` that attaches the bearer token and repairs a
//!   mid-session expiry with exactly one refresh-then-retry
//!
//! Request lifecycle:
//! 1. `ensure()` validates (or refreshes) the access token
//! 2. The request goes out with `Authorization: Bearer ...`
//! 3. A 401 on the first attempt forces one refresh and one retry
//! 4. Anything else non-2xx surfaces as a typed `Error`

pub mod error;
pub mod executor;
pub mod metrics;
pub mod refresh;
pub mod request;
pub mod session;

#[cfg(test)]
mod test_support;

pub use error::{ApiError, Error, Result};
pub use executor::RequestExecutor;
pub use refresh::RefreshCoordinator;
pub use request::{ApiResponse, Query, RequestBody, RequestOptions};
pub use session::{Session, SessionBuilder};

pub use reqwest::Method;
pub use session_auth::{
    FileStorage, KeyValueStorage, MemoryStorage, SubscriberRegistry, Subscription, TokenStore,
};
