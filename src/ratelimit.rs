use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rocket::{
    http::{Header, Status},
    request::{FromRequest, Outcome},
    response::{self, Responder},
    Request, State,
};

use crate::error::Error;

/// Number of distinct clients tracked before idle buckets are swept.
const SWEEP_THRESHOLD: usize = 10_000;

/// Token bucket for one client.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    max_tokens: f64,
    /// Tokens per second.
    refill_rate: f64,
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens as f64,
            last_refill: Instant::now(),
            max_tokens: max_tokens as f64,
            refill_rate,
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn remaining(&self) -> u32 {
        self.tokens as u32
    }

    fn retry_after(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

/// Per-IP request budget, `limit` requests per `window`.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    trust_ip_header: bool,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window: window.max(Duration::from_secs(1)),
            trust_ip_header: false,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Identify clients by the configured `ip_header` when present. Only
    /// enable this behind a proxy that sets the header itself.
    pub fn trusting_ip_header(mut self, trust: bool) -> Self {
        self.trust_ip_header = trust;
        self
    }

    /// The address a request is charged to.
    fn client_of(&self, req: &Request<'_>) -> IpAddr {
        let ip = if self.trust_ip_header {
            req.client_ip()
        } else {
            req.remote().map(|addr| addr.ip())
        };
        ip.unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
    }

    /// Charge one request to `ip`.
    pub fn check(&self, ip: IpAddr) -> Quota {
        let refill_rate = self.limit as f64 / self.window.as_secs_f64();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if buckets.len() >= SWEEP_THRESHOLD {
            if let Some(expiry) = Instant::now().checked_sub(self.window * 2) {
                buckets.retain(|_, bucket| bucket.last_refill > expiry);
            }
        }
        let bucket = buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(self.limit, refill_rate));
        let allowed = bucket.try_consume();
        Quota {
            allowed,
            limit: self.limit,
            remaining: bucket.remaining(),
            retry_after: bucket.retry_after(),
        }
    }
}

/// Outcome of charging a request against the rate limiter.
#[derive(Debug, Copy, Clone)]
pub struct Quota {
    allowed: bool,
    limit: u32,
    remaining: u32,
    retry_after: Duration,
}

impl Quota {
    /// Turn a refused request into an error.
    pub fn admit(&self) -> Result<(), Error> {
        if self.allowed {
            Ok(())
        } else {
            // Round up so clients never retry too early.
            let secs = self.retry_after.as_secs() + u64::from(self.retry_after.subsec_nanos() > 0);
            Err(Error::RateLimited {
                limit: self.limit,
                retry_after: secs.max(1),
            })
        }
    }

    /// Attach the quota headers to a response.
    pub fn wrap<R>(self, inner: R) -> WithQuota<R> {
        WithQuota { inner, quota: self }
    }
}

/// Charge the requesting client's IP. By default this is the peer address of
/// the connection, since headers are under the client's control. Requests
/// without a known address share the unspecified address's budget.
#[rocket::async_trait]
impl<'r> FromRequest<'r> for Quota {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let limiter = match req.guard::<&State<RateLimiter>>().await {
            Outcome::Success(limiter) => limiter,
            _ => return Outcome::Error((Status::InternalServerError, ())),
        };
        Outcome::Success(limiter.check(limiter.client_of(req)))
    }
}

/// A response carrying `X-RateLimit-*` headers.
pub struct WithQuota<R> {
    inner: R,
    quota: Quota,
}

impl<'r, 'o: 'r, R: Responder<'r, 'o>> Responder<'r, 'o> for WithQuota<R> {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let mut response = self.inner.respond_to(req)?;
        response.set_header(Header::new("X-RateLimit-Limit", self.quota.limit.to_string()));
        response.set_header(Header::new(
            "X-RateLimit-Remaining",
            self.quota.remaining.to_string(),
        ));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exhausts_and_reports_retry() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        for expected_remaining in [2, 1, 0] {
            let quota = limiter.check(ip);
            assert!(quota.admit().is_ok());
            assert_eq!(quota.remaining, expected_remaining);
        }
        let refused = limiter.check(ip);
        match refused.admit() {
            Err(Error::RateLimited { limit, retry_after }) => {
                assert_eq!(limit, 3);
                assert!((1..=20).contains(&retry_after));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn clients_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let a: IpAddr = "192.0.2.1".parse().unwrap();
        let b: IpAddr = "192.0.2.2".parse().unwrap();
        assert!(limiter.check(a).admit().is_ok());
        assert!(limiter.check(a).admit().is_err());
        assert!(limiter.check(b).admit().is_ok());
    }
}
