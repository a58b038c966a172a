use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::ModelError;

const MAX_ATTEMPTS: u32 = 3;
const MAX_ERROR_BODY: usize = 2000;

/// POST a JSON body and return the response once it has a success status.
/// Network errors, 429 and 5xx are retried with exponential backoff
/// (1s, 2s); cancellation interrupts both the request and the backoff.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, ModelError> {
    let mut last_error = None;
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1));
            tokio::select! {
                _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let send = client.post(url).headers(headers.clone()).json(body).send();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            result = send => result,
        };

        let error = match result {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                ModelError::Api {
                    status,
                    body: crate::util::truncate_str(&text, MAX_ERROR_BODY),
                }
            }
            Err(e) => ModelError::from(e),
        };

        if !error.is_retryable() {
            return Err(error);
        }
        warn!(url, attempt = attempt + 1, error = %error, "model request failed, retrying");
        last_error = Some(error);
    }
    Err(last_error.unwrap_or_else(|| ModelError::Other("retries exhausted".to_string())))
}
