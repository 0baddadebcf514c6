use foundations::telemetry::metrics::{metrics, Counter, Histogram, HistogramBuilder};

#[metrics]
pub(crate) mod metrics {
    /// Total number of requests made to external APIs (Spotify, Ticketmaster, Supabase, Expo)
    pub fn external_api_requests_total(service: &'static str, endpoint_name: &'static str) -> Counter;

    /// Total number of failed requests made to external APIs
    pub fn external_api_requests_failure_total(
        service: &'static str,
        endpoint_name: &'static str,
    ) -> Counter;

    /// Total number of rate limited requests made to external APIs
    pub fn external_api_requests_rate_limited_total(
        service: &'static str,
        endpoint_name: &'static str,
    ) -> Counter;

    /// Distribution of response times for external APIs, in seconds
    #[ctor = HistogramBuilder {
        buckets: &[0.005, 0.01, 0.025, 0.05, 0.1, 0.15, 0.2, 0.25, 0.35, 0.5, 1.0, 2.5, 5.0, 10.0],
    }]
    pub fn external_api_response_time(service: &'static str) -> Histogram;

    /// Total number of successful follow requests
    pub fn follows_success_total() -> Counter;

    /// Total number of failed follow requests
    pub fn follows_failure_total() -> Counter;

    /// Total number of successful unfollow requests
    pub fn unfollows_success_total() -> Counter;

    /// Total number of failed unfollow requests
    pub fn unfollows_failure_total() -> Counter;

    /// Total number of backfill jobs that completed
    pub fn backfill_jobs_success_total() -> Counter;

    /// Total number of backfill jobs that failed or were dropped
    pub fn backfill_jobs_failure_total() -> Counter;

    /// Total number of events inserted by event synchronization
    pub fn events_inserted_total() -> Counter;

    /// Total number of pre-existing events updated by event synchronization
    pub fn events_updated_total() -> Counter;

    /// Total number of past events removed by the cleanup job
    pub fn events_deleted_total() -> Counter;

    /// Total number of push messages accepted by the push service
    pub fn push_messages_sent_total() -> Counter;

    /// Total number of push messages rejected by the push service
    pub fn push_messages_failed_total() -> Counter;
}

pub use metrics::*;
