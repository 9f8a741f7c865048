//! HTTP probe implementation.

use std::time::{Duration, Instant};

use super::classify::{classify_http, error_chain, FailureCause, HttpAttempt};
use super::ProbeOutcome;

/// Run an HTTP GET probe against the given address.
pub async fn run_http_probe(address: &str, timeout: Duration) -> ProbeOutcome {
    let url = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    let start = Instant::now();
    let attempt = http_attempt(&url, timeout).await;
    let outcome = classify_http(&attempt, start.elapsed());

    tracing::debug!("HTTP probe {} -> {} ({} ms)", url, outcome.status, outcome.duration_ms);
    outcome
}

async fn http_attempt(url: &str, timeout: Duration) -> HttpAttempt {
    let client = match reqwest::Client::builder().timeout(timeout).no_proxy().build() {
        Ok(c) => c,
        Err(e) => return HttpAttempt::Other(error_chain(&e)),
    };

    match client.get(url).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            // Timing includes the body.
            let _ = response.bytes().await;
            HttpAttempt::Response(code)
        }
        Err(e) if e.is_builder() => HttpAttempt::Other(error_chain(&e)),
        Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
            HttpAttempt::Transport(FailureCause::from_reqwest(&e))
        }
        Err(e) => HttpAttempt::Other(error_chain(&e)),
    }
}
