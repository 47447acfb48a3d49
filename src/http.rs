use reqwest::Client;
use std::time::Duration;

/// Shared HTTP client for every provider handle.
///
/// Provider calls such as Gemini analysis over a hundred reviews routinely
/// take tens of seconds, so the request timeout defaults higher than the
/// connect timeout. Both can be tuned from the environment.
pub fn build_client() -> Client {
    let timeout = env_secs("HTTP_TIMEOUT_SECS").unwrap_or(90);
    let connect = env_secs("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(10);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(concat!("product-insights/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn env_secs(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
}
