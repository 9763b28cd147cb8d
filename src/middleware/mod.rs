pub mod builder;

use crate::backend::{Backend, RateLimitStatus};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use builder::RateLimiterBuilder;
use futures::future::{ok, LocalBoxFuture, Ready};
use std::cell::RefCell;
use std::{future::Future, rc::Rc};

type AllowedTransformation = dyn Fn(&mut HeaderMap, Option<&RateLimitStatus>);
type DeniedResponse = dyn Fn(&RateLimitStatus) -> HttpResponse;
type RollbackCondition = dyn Fn(StatusCode) -> bool;

/// Rate limit middleware.
pub struct RateLimiter<BA, F> {
    backend: BA,
    key_fn: Rc<F>,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<BA, BI, F, O> Clone for RateLimiter<BA, F>
where
    BA: Backend<BI> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            key_fn: self.key_fn.clone(),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        }
    }
}

impl<BA, BI, F, O> RateLimiter<BA, F>
where
    BA: Backend<BI> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    /// # Arguments
    ///
    /// * `backend`: A rate limiting algorithm and store implementation.
    /// * `key_fn`: A future that produces input to the backend (usually the rate limit key) based
    ///   on the incoming request, see [KeyFunctionBuilder](crate::backend::KeyFunctionBuilder).
    pub fn builder(backend: BA, key_fn: F) -> RateLimiterBuilder<BA, F> {
        RateLimiterBuilder::new(backend, key_fn)
    }
}

impl<S, B, BA, BI, BE, F, O> Transform<S, ServiceRequest> for RateLimiter<BA, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Error = BE> + 'static,
    BI: 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = RateLimiterMiddleware<S, BA, F>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimiterMiddleware {
            service: Rc::new(RefCell::new(service)),
            backend: self.backend.clone(),
            key_fn: Rc::clone(&self.key_fn),
            fail_open: self.fail_open,
            allowed_transformation: self.allowed_transformation.clone(),
            denied_response: self.denied_response.clone(),
            rollback_condition: self.rollback_condition.clone(),
        })
    }
}

pub struct RateLimiterMiddleware<S, BA, F> {
    service: Rc<RefCell<S>>,
    backend: BA,
    key_fn: Rc<F>,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation>>,
    denied_response: Rc<DeniedResponse>,
    rollback_condition: Option<Rc<RollbackCondition>>,
}

impl<S, B, BA, BI, BE, F, O> Service<ServiceRequest> for RateLimiterMiddleware<S, BA, F>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
    BA: Backend<BI, Error = BE> + 'static,
    BI: 'static,
    BE: Into<actix_web::Error> + std::fmt::Display + 'static,
    F: Fn(&ServiceRequest) -> O + 'static,
    O: Future<Output = Result<BI, actix_web::Error>>,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let backend = self.backend.clone();
        let key_fn = self.key_fn.clone();
        let fail_open = self.fail_open;
        let allowed_transformation = self.allowed_transformation.clone();
        let denied_response = self.denied_response.clone();
        let rollback_condition = self.rollback_condition.clone();

        Box::pin(async move {
            let input = match (key_fn)(&req).await {
                Ok(input) => input,
                Err(e) => {
                    log::error!("Rate limiter key function failed: {e}");
                    return Ok(req.into_response(e.error_response()).map_into_right_body());
                }
            };

            let (status, rollback) = match backend.request(input).await {
                // Able to successfully query rate limiter backend
                Ok((status, rollback)) => {
                    if status.decision.is_denied() {
                        log::debug!(
                            "Denied {} {}, retry after {}s",
                            req.method(),
                            req.path(),
                            status.retry_after()
                        );
                        let response: HttpResponse = (denied_response)(&status);
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                    (Some(status), Some(rollback))
                }
                // Unable to query rate limiter backend
                Err(e) => {
                    if fail_open {
                        log::warn!("Rate limiter failed: {}, allowing the request anyway", e);
                        (None, None)
                    } else {
                        log::error!("Rate limiter failed: {}", e);
                        return Ok(req
                            .into_response(e.into().error_response())
                            .map_into_right_body());
                    }
                }
            };

            let mut service_response = service.call(req).await?;

            if let (Some(token), Some(rollback_condition)) = (rollback, rollback_condition) {
                let status = service_response.status();
                if rollback_condition(status) {
                    match backend.rollback(token).await {
                        Ok(()) => log::debug!(
                            "Rolled back rate-limit count for {} response to {}",
                            status,
                            service_response.request().path()
                        ),
                        Err(e) => log::error!(
                            "Unable to rollback rate-limit count for response: {:?}, error: {e}",
                            status
                        ),
                    }
                }
            }

            if let Some(transformation) = allowed_transformation {
                (transformation)(service_response.headers_mut(), status.as_ref());
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
