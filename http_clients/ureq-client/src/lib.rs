use anyhow::Result;
use async_trait::async_trait;
use voxcore::net::{HttpClient, HttpRequest, HttpResponse};

/// HTTP client implementation using `ureq` for synchronous HTTP requests.
/// Since `ureq` is blocking, all requests are wrapped in `tokio::task::spawn_blocking`.
///
/// Non-2xx statuses are returned as responses, not errors; callers decide
/// what a status means.
#[derive(Debug, Clone)]
pub struct UreqHttpClient;

impl UreqHttpClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        // Since ureq is blocking, we must use spawn_blocking
        tokio::task::spawn_blocking(move || {
            let response = match request.method.as_str() {
                "GET" => {
                    let mut req = ureq::get(&request.url)
                        .config()
                        .http_status_as_error(false)
                        .timeout_global(request.timeout)
                        .build();
                    for (key, value) in &request.headers {
                        req = req.header(key, value);
                    }
                    req.call()?
                }
                "POST" => {
                    let mut req = ureq::post(&request.url)
                        .config()
                        .http_status_as_error(false)
                        .timeout_global(request.timeout)
                        .build();
                    for (key, value) in &request.headers {
                        req = req.header(key, value);
                    }
                    if let Some(body) = request.body {
                        req.send(&body[..])?
                    } else {
                        req.send_empty()?
                    }
                }
                method => {
                    return Err(anyhow::anyhow!("Unsupported HTTP method: {}", method));
                }
            };

            let status_code = response.status().as_u16();

            // Read the response body
            let mut body = response.into_body();
            let body_bytes = body.read_to_vec()?;

            Ok(HttpResponse {
                status_code,
                body: body_bytes,
            })
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await;
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
        });
        format!("http://{addr}/toy/ota/")
    }

    #[tokio::test]
    async fn test_non_success_status_is_returned() {
        let url = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 2\r\nConnection: close\r\n\r\nno",
        )
        .await;

        let response = UreqHttpClient::new()
            .execute(HttpRequest::get(url))
            .await
            .unwrap();
        assert_eq!(response.status_code, 404);
        assert_eq!(response.body, b"no");
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_post_json_body() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 18\r\nConnection: close\r\n\r\n{\"activated\":true}",
        )
        .await;

        let request = HttpRequest::post(url)
            .with_header("device-id", "00:16:3e:00:00:01")
            .with_json(&vec![1u32, 2, 3])
            .unwrap();
        let response = UreqHttpClient::new().execute(request).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.body_string().unwrap(), r#"{"activated":true}"#);
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let mut request = HttpRequest::get("http://127.0.0.1:1/");
        request.method = "DELETE".to_string();
        assert!(UreqHttpClient::new().execute(request).await.is_err());
    }
}
