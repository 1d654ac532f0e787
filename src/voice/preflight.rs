//! Startup check that the configured upstream model is reachable.
//!
//! A plain idempotent GET, so it goes through [`RetryPolicy`]. Failure is
//! reported but never stops the gateway: sessions still try to connect and
//! fall back to error audio if the upstream really is down.

use std::time::Duration;

use crate::reliability::{RetryError, RetryPolicy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET {status_url}/{model}` with bearer auth; success is any 2xx.
pub async fn check_model(
    client: &reqwest::Client,
    status_url: &str,
    api_key: &str,
    model: &str,
    policy: &RetryPolicy,
) -> Result<(), RetryError<anyhow::Error>> {
    let url = format!(
        "{}/{}",
        status_url.trim_end_matches('/'),
        urlencoding::encode(model)
    );

    policy
        .run("upstream model status", |attempt| {
            let request = client
                .get(&url)
                .bearer_auth(api_key)
                .timeout(REQUEST_TIMEOUT);
            async move {
                tracing::debug!(attempt = attempt + 1, "Checking upstream model status");
                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    anyhow::bail!("status endpoint answered HTTP {status}");
                }
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer each connection with the next canned status line.
    async fn canned_server(statuses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for status in statuses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}");
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        format!("http://{addr}/v1/models")
    }

    #[tokio::test]
    async fn retries_until_model_is_reachable() {
        let url = canned_server(vec!["503 Service Unavailable", "200 OK"]).await;
        let policy = RetryPolicy::new(3, Duration::from_millis(5));
        let client = reqwest::Client::new();

        check_model(&client, &url, "sk-test", "gpt-4o-realtime-preview", &policy)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let url = canned_server(vec!["404 Not Found", "404 Not Found"]).await;
        let policy = RetryPolicy::new(1, Duration::from_millis(5));
        let client = reqwest::Client::new();

        let err = check_model(&client, &url, "sk-test", "missing-model", &policy)
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert!(err.to_string().contains("HTTP 404"));
    }
}
