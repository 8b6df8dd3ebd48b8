use std::collections::HashMap;

use async_tungstenite::{
    tokio::connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue},
};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::binary_protocol::KERNEL_WEBSOCKET_PROTOCOL;
use crate::error::{ApiError, Result};
use crate::websocket::{KernelSocket, ProtocolMode};

const USER_AGENT: &str = concat!("jupyter-server-client/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(default)]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelLaunchRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// The `spec` block of a kernelspec; only the fields listings show.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelSpecFile {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    #[serde(default)]
    pub spec: KernelSpecFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpecsResponse {
    pub default: String,
    pub kernelspecs: HashMap<String, KernelSpec>,
}

/// A `/api/contents` model. `content` is only present when requested and is a
/// notebook document, a string, or a list of child models for directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contents {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl Contents {
    /// Child models of a directory listing.
    pub fn children(&self) -> Vec<Contents> {
        match &self.content {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileIdResponse {
    id: String,
}

/// Handle on one Jupyter server: a base URL, an optional token, and a pooled
/// HTTP client.
#[derive(Debug, Clone)]
pub struct JupyterServer {
    base_url: Url,
    token: Option<String>,
    http: reqwest::Client,
}

fn api_url(base_url: &Url, path: &str) -> String {
    format!(
        "{}/api/{}",
        base_url.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

impl JupyterServer {
    /// Accepts the URL a user copies from `jupyter server list`, e.g.
    /// `http://127.0.0.1:8888/lab?token=abc`. An explicit `token` wins over
    /// the one in the query string.
    pub fn new(url: &str, token: Option<String>) -> Result<Self> {
        let mut parsed = Url::parse(url).map_err(|e| ApiError::InvalidUrl(format!("{url}: {e}")))?;
        let query_token = parsed
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned());

        let path = parsed
            .path()
            .trim_end_matches('/')
            .trim_end_matches("/tree")
            .trim_end_matches("/lab")
            .to_string();
        parsed.set_path(&path);
        parsed.set_query(None);
        parsed.set_fragment(None);

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| ApiError::Transport {
                url: url.to_string(),
                source,
            })?;

        Ok(Self {
            base_url: parsed,
            token: token.filter(|t| !t.is_empty()).or(query_token),
            http,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn api_url(&self, path: &str) -> String {
        api_url(&self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> (String, RequestBuilder) {
        let url = self.api_url(path);
        let mut builder = self.http.request(method, &url);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("token {token}"));
        }
        (url, builder)
    }

    async fn send(url: &str, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(|source| ApiError::Transport {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(url: &str, builder: RequestBuilder) -> Result<T> {
        let response = Self::send(url, builder).await?;
        response.json::<T>().await.map_err(|e| ApiError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    fn contents_path(path: &str) -> String {
        format!("contents/{}", path.trim_start_matches('/'))
    }

    pub async fn get_contents(&self, path: &str, with_content: bool) -> Result<Contents> {
        let (url, builder) = self.request(Method::GET, &Self::contents_path(path));
        let builder = builder.query(&[("content", if with_content { "1" } else { "0" })]);
        Self::json(&url, builder).await
    }

    /// Fetches a notebook document as JSON.
    pub async fn get_notebook(&self, path: &str) -> Result<Value> {
        let (url, builder) = self.request(Method::GET, &Self::contents_path(path));
        let builder = builder.query(&[("type", "notebook"), ("content", "1")]);
        let contents: Contents = Self::json(&url, builder).await?;
        contents.content.ok_or_else(|| ApiError::Decode {
            url,
            reason: "notebook model has no content".into(),
        })
    }

    pub async fn save_notebook(&self, path: &str, notebook: &Value) -> Result<Contents> {
        let (url, builder) = self.request(Method::PUT, &Self::contents_path(path));
        let builder = builder.json(&json!({
            "type": "notebook",
            "format": "json",
            "content": notebook,
        }));
        Self::json(&url, builder).await
    }

    /// `None` when the path does not exist.
    pub async fn stat(&self, path: &str) -> Result<Option<Contents>> {
        match self.get_contents(path, false).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<Contents>> {
        let (url, builder) = self.request(Method::GET, &Self::contents_path(path));
        let builder = builder.query(&[("type", "directory"), ("content", "1")]);
        let listing: Contents = Self::json(&url, builder).await?;
        Ok(listing.children())
    }

    pub async fn list_kernels(&self) -> Result<Vec<Kernel>> {
        let (url, builder) = self.request(Method::GET, "kernels");
        Self::json(&url, builder).await
    }

    pub async fn get_kernel(&self, kernel_id: &str) -> Result<Option<Kernel>> {
        let (url, builder) = self.request(Method::GET, &format!("kernels/{kernel_id}"));
        match Self::json(&url, builder).await {
            Ok(kernel) => Ok(Some(kernel)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn kernel_specs(&self) -> Result<KernelSpecsResponse> {
        let (url, builder) = self.request(Method::GET, "kernelspecs");
        Self::json(&url, builder).await
    }

    /// Launches a kernel; `name = None` picks the server's default kernelspec.
    pub async fn start_kernel(&self, name: Option<&str>, path: Option<&str>) -> Result<Kernel> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.kernel_specs().await?.default,
        };
        let (url, builder) = self.request(Method::POST, "kernels");
        let builder = builder.json(&KernelLaunchRequest {
            name,
            path: path.map(str::to_string),
        });
        Self::json(&url, builder).await
    }

    pub async fn shutdown_kernel(&self, kernel_id: &str) -> Result<()> {
        let (url, builder) = self.request(Method::DELETE, &format!("kernels/{kernel_id}"));
        Self::send(&url, builder).await.map(drop)
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<()> {
        let (url, builder) = self.request(Method::POST, &format!("kernels/{kernel_id}/interrupt"));
        Self::send(&url, builder).await.map(drop)
    }

    /// Resolves (and indexes if needed) the stable file id collaboration
    /// rooms are keyed by.
    pub async fn file_id(&self, path: &str) -> Result<String> {
        let (url, builder) = self.request(Method::POST, "fileid/index");
        let builder = builder.query(&[("path", path)]);
        let response: FileIdResponse = Self::json(&url, builder).await?;
        Ok(response.id)
    }

    /// WebSocket URL for an API path, carrying the token as a query parameter
    /// since browsers cannot set headers on upgrades and servers accept both.
    pub fn websocket_url(&self, path: &str, extra: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&self.api_url(path))
            .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ApiError::InvalidUrl(format!("cannot use {scheme} for {url}")))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Opens a kernel's channel socket, offering the v1 binary subprotocol
    /// and falling back to JSON frames when the server does not pick it.
    pub async fn connect_to_kernel(
        &self,
        kernel_id: &str,
        session_id: Option<&str>,
    ) -> Result<KernelSocket> {
        let extra: Vec<(&str, &str)> = session_id.map(|sid| ("session_id", sid)).into_iter().collect();
        let url = self.websocket_url(&format!("kernels/{kernel_id}/channels"), &extra)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ApiError::WebSocket(e.into()))?;
        let headers = request.headers_mut();
        headers.insert("User-Agent", HeaderValue::from_static(USER_AGENT));
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(KERNEL_WEBSOCKET_PROTOCOL),
        );

        let (inner, response) = connect_async(request)
            .await
            .map_err(|e| ApiError::WebSocket(e.into()))?;

        let protocol_mode = match response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
        {
            Some(KERNEL_WEBSOCKET_PROTOCOL) => ProtocolMode::BinaryV1,
            _ => ProtocolMode::Json,
        };
        tracing::debug!(kernel_id, ?protocol_mode, "kernel socket connected");

        Ok(KernelSocket {
            inner,
            protocol_mode,
        })
    }
}
