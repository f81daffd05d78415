use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

pub mod forwarding;

pub use forwarding::Forwarder;

/// Machine-to-machine transport. The engine only ever talks to peers through
/// this seam, which keeps token forwarding testable without sockets.
#[async_trait]
pub trait MachineNetwork: Send + Sync {
    async fn request(
        &self,
        ip: &str,
        port: u16,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value>;
}

pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new() -> Self {
        HttpNetwork {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineNetwork for HttpNetwork {
    async fn request(
        &self,
        ip: &str,
        port: u16,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| anyhow!("invalid http method: {}", method))?;
        let host = if ip.contains(':') {
            format!("[{ip}]")
        } else {
            ip.to_string()
        };
        let url = format!("http://{}:{}/{}", host, port, path.trim_start_matches('/'));

        let mut request = self.client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{} answered with status {}", url, status));
        }
        // Peers are free to answer with an empty body.
        Ok(response.json::<Value>().await.unwrap_or(Value::Null))
    }
}
