//! Shared plumbing for talking to the external JSON APIs (Spotify, Ticketmaster).

use std::time::{Duration, Instant};

use reqwest::{header::RETRY_AFTER, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::{error::ApiError, metrics};

const REQWEST_CLIENT_LIFETIME_SECS: u64 = 60 * 5;
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 5;
/// Upper bound on a single `Retry-After` wait
const MAX_RATE_LIMIT_WAIT_SECS: u64 = 60;
pub(crate) const MAX_RATE_LIMIT_RETRIES: usize = 3;

lazy_static::lazy_static! {
    static ref REQWEST_CLIENT_CACHE: RwLock<(Instant, reqwest::Client)> = RwLock::new((Instant::now(), reqwest::Client::new()));
}

pub(crate) async fn get_reqwest_client() -> reqwest::Client {
    let client_cache = REQWEST_CLIENT_CACHE.read().await;
    if client_cache.0.elapsed().as_secs() < REQWEST_CLIENT_LIFETIME_SECS {
        return client_cache.1.clone();
    }

    drop(client_cache);
    let mut client_cache = REQWEST_CLIENT_CACHE.write().await;
    if client_cache.0.elapsed().as_secs() < REQWEST_CLIENT_LIFETIME_SECS {
        return client_cache.1.clone();
    }

    *client_cache = (Instant::now(), reqwest::Client::new());
    client_cache.1.clone()
}

fn retry_after_secs(header: Option<&str>) -> u64 {
    header
        .and_then(|val| val.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS)
        .min(MAX_RATE_LIMIT_WAIT_SECS)
}

fn retry_after(res: &Response) -> Duration {
    let header = res.headers().get(RETRY_AFTER).and_then(|val| val.to_str().ok());
    Duration::from_secs(retry_after_secs(header))
}

/// Reads the body of a successful response as JSON.
pub(crate) async fn decode_json<T: DeserializeOwned>(
    service: &'static str,
    url: &str,
    res: Response,
) -> Result<T, ApiError> {
    let body = res.text().await.map_err(|err| {
        error!("Error reading response from {}: {:?}, url={}", service, err, url);
        ApiError::Transport {
            service,
            source: err,
        }
    })?;

    serde_json::from_str(&body).map_err(|err| {
        if cfg!(debug_assertions) {
            error!(
                "Error decoding JSON from {}: {:?}, url={}, res={}",
                service, err, url, body
            );
        } else {
            error!("Error decoding JSON from {}: {:?}, url={}", service, err, url);
        }
        ApiError::Decode {
            service,
            message: err.to_string(),
        }
    })
}

/// Sends a GET-style request built by `build_request`, waiting out `429` responses a bounded number of times.
/// A `404` is mapped to `Ok(None)` so that "get by id" callers can tell a missing entity apart from a failure.
pub(crate) async fn send_json_request<T: DeserializeOwned>(
    service: &'static str,
    endpoint_name: &'static str,
    url: &str,
    build_request: impl Fn() -> RequestBuilder,
) -> Result<Option<T>, ApiError> {
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!("Hitting {} API at URL {}", service, url);
        metrics::external_api_requests_total(service, endpoint_name).inc();
        let start = Instant::now();
        let res = build_request().send().await;
        metrics::external_api_response_time(service).observe(start.elapsed().as_secs_f64());

        let res = res.map_err(|err| {
            error!("Error communicating with {} API: {:?}", service, err);
            metrics::external_api_requests_failure_total(service, endpoint_name).inc();
            ApiError::Transport {
                service,
                source: err,
            }
        })?;

        match res.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                metrics::external_api_requests_rate_limited_total(service, endpoint_name).inc();
                if attempt >= MAX_RATE_LIMIT_RETRIES {
                    warn!(
                        "Rate limited {} times when hitting url={}; giving up",
                        attempt, url
                    );
                    return Err(ApiError::RateLimited(service));
                }

                let wait = retry_after(&res);
                warn!(
                    "Rate limited when hitting url={}, waiting {:?} before retrying...",
                    url, wait
                );
                tokio::time::sleep(wait).await;
            },
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                let body = res.text().await.unwrap_or_default();
                error!(
                    "Got bad status code of {} from {} API: {:?}",
                    status, service, body
                );
                metrics::external_api_requests_failure_total(service, endpoint_name).inc();
                return Err(ApiError::BadStatus {
                    service,
                    status: status.as_u16(),
                    body,
                });
            },
            _ => return decode_json(service, url, res).await.map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_bounded() {
        assert_eq!(retry_after_secs(Some("2")), 2);
        assert_eq!(retry_after_secs(Some(" 30 ")), 30);
        assert_eq!(retry_after_secs(Some("86400")), MAX_RATE_LIMIT_WAIT_SECS);
        assert_eq!(retry_after_secs(Some("Wed, 21 Oct 2015 07:28:00 GMT")), DEFAULT_RATE_LIMIT_WAIT_SECS);
        assert_eq!(retry_after_secs(None), DEFAULT_RATE_LIMIT_WAIT_SECS);
    }
}
