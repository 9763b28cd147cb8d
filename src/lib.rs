#![cfg_attr(docsrs, feature(doc_cfg))]
//! Sliding window rate limiting for actix-web.
//!
//! ```no_run
//! # use actix_sliding_rate_limit::backend::memory::InMemoryBackend;
//! # use actix_sliding_rate_limit::backend::KeyFunctionBuilder;
//! # use actix_sliding_rate_limit::{Policy, RateLimiter};
//! # use actix_web::App;
//! let backend = InMemoryBackend::builder(Policy::auth()).build();
//! let key_fn = KeyFunctionBuilder::new()
//!     .custom_key("waitlist")
//!     .real_ip_key()
//!     .build();
//! let app = App::new().wrap(RateLimiter::builder(backend, key_fn).add_headers().build());
//! ```

pub mod backend;
mod middleware;
pub mod policy;

pub use middleware::builder::RateLimiterBuilder;
pub use middleware::RateLimiter;
pub use policy::{ConfigurationError, Policy};
