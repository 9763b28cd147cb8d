use crate::backend::{Backend, RateLimitStatus};
use crate::middleware::{AllowedTransformation, DeniedResponse, RateLimiter, RollbackCondition};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{ContentType, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub const DENIED_BODY: &str =
    r#"{"success":false,"error":"Too many requests. Please try again later."}"#;

pub struct RateLimiterBuilder<BA, F> {
    backend: BA,
    key_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<BA, BI, F, O> RateLimiterBuilder<BA, F>
where
    BA: Backend<BI> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    pub(super) fn new(backend: BA, key_fn: F) -> Self {
        Self {
            backend,
            key_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(|status: &RateLimitStatus| {
                let mut response = too_many_requests();
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(status.retry_after()));
                response
            }),
            rollback_condition: None,
        }
    }

    /// Choose whether to allow a request if the backend returns a failure.
    ///
    /// Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Sets the [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response] functions, such that the following headers
    /// are set in both the allowed and denied responses:
    ///
    /// - `x-ratelimit-limit`\
    /// - `x-ratelimit-remaining`\
    /// - `x-ratelimit-reset` (seconds until the reset)
    /// - `retry-after` (denied only, seconds until a request would be admitted)
    pub fn add_headers(mut self) -> Self {
        self.allowed_transformation = Some(Rc::new(
            |map: &mut HeaderMap, status: Option<&RateLimitStatus>| {
                if let Some(status) = status {
                    insert_status_headers(map, status);
                }
            },
        ));
        self.denied_response = Rc::new(|status: &RateLimitStatus| {
            let mut response = too_many_requests();
            let map = response.headers_mut();
            insert_status_headers(map, status);
            map.insert(RETRY_AFTER, HeaderValue::from(status.retry_after()));
            response
        });
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    ///
    /// By default no changes are made to the response.
    ///
    /// Note the status will be [None] if the backend failed and [RateLimiterBuilder::fail_open]
    /// is enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&RateLimitStatus>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to status 429 with a `retry-after` header and a JSON error body.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&RateLimitStatus) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    /// After processing a request, attempt to rollback the request count based on the status code
    /// of the returned response.
    ///
    /// By default the rate limit is never rolled back.
    pub fn rollback_condition<C>(mut self, condition: Option<C>) -> Self
    where
        C: Fn(StatusCode) -> bool + 'static,
    {
        self.rollback_condition = condition.map(|m| Rc::new(m) as Rc<RollbackCondition>);
        self
    }

    /// Configures the [RateLimiterBuilder::rollback_condition] to rollback if the status code
    /// is a server error (5xx).
    pub fn rollback_server_errors(mut self) -> Self {
        self.rollback_condition = Some(Rc::new(|status: StatusCode| status.is_server_error()));
        self
    }

    pub fn build(self) -> RateLimiter<BA, F> {
        RateLimiter {
            backend: self.backend,
            key_fn: Rc::new(self.key_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation,
            denied_response: self.denied_response,
            rollback_condition: self.rollback_condition,
        }
    }
}

fn too_many_requests() -> HttpResponse {
    HttpResponse::TooManyRequests()
        .content_type(ContentType::json())
        .body(DENIED_BODY)
}

fn insert_status_headers(map: &mut HeaderMap, status: &RateLimitStatus) {
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(status.limit()));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(status.remaining()),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(status.seconds_until_reset()),
    );
}
