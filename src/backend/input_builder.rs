use actix_web::dev::ServiceRequest;
use std::future::{ready, Ready};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

pub type KeyFuture = Ready<Result<String, actix_web::Error>>;

/// Substituted for any key component that is missing, empty or unparsable.
pub const UNKNOWN_KEY: &str = "unknown";

const SEPARATOR: &str = ":";

/// Utility to create a key function that turns a request into a rate limit key.
///
/// Components are added in a fixed order (custom key, real IP, peer IP, path, custom function)
/// and joined with `:`, e.g. `custom_key("waitlist").real_ip_key()` yields `waitlist:203.0.113.5`.
///
/// Limiters with different policies never share state, but when several routes share one
/// limiter you should namespace the keys yourself with [KeyFunctionBuilder::custom_key].
#[derive(Default)]
pub struct KeyFunctionBuilder {
    real_ip_key: bool,
    peer_ip_key: bool,
    path_key: bool,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
}

impl KeyFunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the client's real IP to the rate limiting key.
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which is only suitable for Actix applications deployed behind a proxy that you
    /// control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn real_ip_key(mut self) -> Self {
        self.real_ip_key = true;
        self
    }

    /// Adds the connection peer IP to the rate limiting key.
    ///
    /// This is suitable when clients connect directly to the Actix application.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn peer_ip_key(mut self) -> Self {
        self.peer_ip_key = true;
        self
    }

    /// Add the request path to the rate limiting key
    pub fn path_key(mut self) -> Self {
        self.path_key = true;
        self
    }

    /// Add a custom component to the rate limiting key, typically a route name
    pub fn custom_key(mut self, key: &str) -> Self {
        self.custom_key = Some(key.to_owned());
        self
    }

    /// Dynamically add a custom component to the rate limiting key, such as the id of the
    /// authenticated user
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.custom_fn = Some(Box::new(f));
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> KeyFuture + 'static {
        move |req| {
            ready((|| {
                let mut components = Vec::new();
                if let Some(custom) = &self.custom_key {
                    components.push(non_empty(custom.clone()));
                }
                if self.real_ip_key || self.peer_ip_key {
                    let info = req.connection_info();
                    if self.real_ip_key {
                        components.push(ip_key(info.realip_remote_addr()));
                    }
                    if self.peer_ip_key {
                        components.push(ip_key(info.peer_addr()));
                    }
                }
                if self.path_key {
                    components.push(non_empty(req.path().to_owned()));
                }
                if let Some(f) = &self.custom_fn {
                    components.push(non_empty(f(req)?));
                }
                if components.is_empty() {
                    return Ok(UNKNOWN_KEY.to_owned());
                }
                Ok(components.join(SEPARATOR))
            })())
        }
    }
}

fn non_empty(component: String) -> String {
    if component.is_empty() {
        UNKNOWN_KEY.to_owned()
    } else {
        component
    }
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(addr: Option<&str>) -> String {
    let Some(ip) = addr.and_then(parse_ip) else {
        return UNKNOWN_KEY.to_owned();
    };
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.to_string();
            }
            let [a, b, c, d, ..] = v6.segments();
            format!("{}/64", Ipv6Addr::new(a, b, c, d, 0, 0, 0, 0))
        }
    }
}

// Forwarded headers may carry a port alongside the address.
fn parse_ip(addr: &str) -> Option<IpAddr> {
    let addr = addr.trim();
    addr.parse::<IpAddr>()
        .ok()
        .or_else(|| addr.parse::<SocketAddr>().ok().map(|s| s.ip()))
}
