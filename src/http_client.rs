use anyhow::{Context, Result, ensure};
use reqwest::{Client, Response};
use std::path::Path;

/// Create a Unix socket client for local service communication
///
/// Accepts either a raw path or a URI with `unix://` scheme.
///
/// # Examples
/// ```no_run
/// use ota_agent::http_client::unix_socket_client;
///
/// let client = unix_socket_client("/run/device-service/api.sock")
///     .expect("failed to create client");
/// ```
pub fn unix_socket_client(socket_path: &str) -> Result<Client> {
    let socket_path = Path::new(socket_path.strip_prefix("unix://").unwrap_or(socket_path));

    // Verify the socket path exists
    ensure!(
        socket_path
            .try_exists()
            .context("failed to check if socket path exists")?,
        "failed since socket path does not exist: {socket_path:?}"
    );

    Client::builder()
        .unix_socket(socket_path)
        .build()
        .context("failed to create Unix socket HTTP client")
}

/// Handle HTTP response by checking status and extracting body
///
/// Ensures the response status is successful and extracts the body text.
///
/// # Arguments
/// * `res` - The HTTP response to handle
/// * `context_msg` - Context message describing the request (e.g., "client init request")
pub async fn handle_http_response(res: Response, context_msg: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().await.context("failed to read response body")?;

    ensure!(
        status.is_success(),
        "{context_msg} failed with status {status} and body: {body}"
    );

    Ok(body)
}
