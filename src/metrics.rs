use prometheus::{Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Global metrics for Orbit
pub struct Metrics {
    pub registry: Registry,

    // Request metrics
    pub requests_total: CounterVec,
    pub request_duration_seconds: HistogramVec,

    // Login flow metrics
    pub logins_started_total: Counter,
    pub logins_completed_total: Counter,
    pub login_failures_total: CounterVec,
    pub oauth_pending_states: Gauge,

    // Queue metrics
    pub votes_total: CounterVec,

    // Credential metrics
    pub credential_crypto_failures_total: CounterVec,
    pub token_refreshes_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Request metrics
        let requests_total = CounterVec::new(
            Opts::new("orbit_requests_total", "Total number of HTTP requests"),
            &["endpoint", "method", "status"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "orbit_request_duration_seconds",
                "Request duration in seconds",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.5, 5.0]),
            &["endpoint", "method"],
        )?;

        // Login flow metrics
        let logins_started_total = Counter::new(
            "orbit_logins_started_total",
            "Authorization redirects issued",
        )?;

        let logins_completed_total = Counter::new(
            "orbit_logins_completed_total",
            "Callbacks that ended in an issued session token",
        )?;

        let login_failures_total = CounterVec::new(
            Opts::new(
                "orbit_login_failures_total",
                "Callbacks that failed, by stage",
            ),
            &["stage"], // state, exchange, identity, provision
        )?;

        let oauth_pending_states = Gauge::new(
            "orbit_oauth_pending_states",
            "Issued and not yet consumed authorization states",
        )?;

        // Queue metrics
        let votes_total = CounterVec::new(
            Opts::new("orbit_votes_total", "Votes cast on queue items"),
            &["vote_type"],
        )?;

        // Credential metrics
        let credential_crypto_failures_total = CounterVec::new(
            Opts::new(
                "orbit_credential_crypto_failures_total",
                "Credential encrypt/decrypt failures",
            ),
            &["operation"],
        )?;

        let token_refreshes_total = CounterVec::new(
            Opts::new(
                "orbit_token_refreshes_total",
                "Provider access token refresh attempts",
            ),
            &["status"],
        )?;

        // Register all metrics
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(logins_started_total.clone()))?;
        registry.register(Box::new(logins_completed_total.clone()))?;
        registry.register(Box::new(login_failures_total.clone()))?;
        registry.register(Box::new(oauth_pending_states.clone()))?;
        registry.register(Box::new(votes_total.clone()))?;
        registry.register(Box::new(credential_crypto_failures_total.clone()))?;
        registry.register(Box::new(token_refreshes_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            logins_started_total,
            logins_completed_total,
            login_failures_total,
            oauth_pending_states,
            votes_total,
            credential_crypto_failures_total,
            token_refreshes_total,
        })
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<Arc<Metrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(Metrics::default()));
