use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::{Duration, Instant};

pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("request failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("deadline exceeded after {attempts} attempts: {source}")]
    DeadlineExceeded {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

/// Transport errors, 5xx and 429 are worth another attempt; everything else
/// is a terminal answer from the server.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Execute a request with exponential backoff, rebuilding it each attempt so
/// the body is regenerated. Delays run 1s, 2s, 4s capped at 10s. A deadline
/// preempts the backoff sleep and surfaces the last underlying error.
pub async fn send_with_retry<F>(
    build: F,
    deadline: Option<Instant>,
) -> Result<Response, RetryError>
where
    F: Fn() -> RequestBuilder,
{
    let mut delay = INITIAL_RETRY_DELAY;
    let mut last_err: Option<reqwest::Error> = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now + delay >= deadline {
                    return Err(RetryError::DeadlineExceeded {
                        attempts: attempt,
                        source: last_err.expect("retry implies a prior error"),
                    });
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }

        match build().send().await {
            Ok(resp) if is_retryable_status(resp.status()) => {
                last_err = resp.error_for_status().err();
            }
            Ok(resp) => return Ok(resp),
            Err(err) => last_err = Some(err),
        }
    }

    Err(RetryError::Exhausted {
        attempts: MAX_RETRIES + 1,
        source: last_err.expect("loop always records an error before exhausting"),
    })
}
