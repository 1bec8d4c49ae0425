//! Image tools built from configuration: generators (text-to-image over a
//! JSON POST) and image searches (keyword or reverse lookups over GET).
//!
//! Every image tool takes one `arg` and answers with a single string: the
//! value found at `result_pointer` in the JSON response. A generator that
//! returns base64 image data instead of a URL writes it under `save_dir`
//! and answers with the file path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as HttpClient, Url};
use serde_json::{Map, Value};

use super::config::{ImageMethod, ImageToolConfig};
use super::{required_arg, RegistryError, Tool, ToolError, ToolParam};
use crate::agent_core::tokens::cap_with_marker;
use crate::config::interpolate_env_vars;

const MAX_OUTPUT_CHARS: usize = 4000;
const ERROR_BODY_CHARS: usize = 300;
const ARG_PLACEHOLDER: &str = "{arg}";

pub struct ImageTool {
    name: String,
    description: String,
    method: ImageMethod,
    url: Url,
    query_param: String,
    params: BTreeMap<String, String>,
    body: Value,
    headers: HeaderMap,
    result_pointer: String,
    save_dir: Option<PathBuf>,
    timeout: Duration,
    http: HttpClient,
}

fn image_params() -> &'static [ToolParam] {
    static PARAMS: OnceLock<Vec<ToolParam>> = OnceLock::new();
    PARAMS.get_or_init(|| {
        vec![ToolParam::new(
            "arg",
            "Prompt, search keywords, or image URL, depending on the tool.",
        )]
    })
}

impl ImageTool {
    pub fn from_config(config: &ImageToolConfig) -> Result<Self, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidTool {
            name: config.name.clone(),
            reason,
        };

        let url = Url::parse(config.url.trim())
            .map_err(|e| invalid(format!("bad url '{}': {e}", config.url)))?;
        if config.timeout_secs == 0 {
            return Err(invalid("timeout_secs must be positive".into()));
        }
        if !config.result_pointer.is_empty() && !config.result_pointer.starts_with('/') {
            return Err(invalid(format!(
                "result_pointer '{}' must start with '/'",
                config.result_pointer
            )));
        }
        if config.method == ImageMethod::Post && config.body.is_none() {
            return Err(invalid("post tools need a body template".into()));
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| invalid(format!("bad header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(&interpolate_env_vars(value))
                .map_err(|e| invalid(format!("bad value for header '{key}': {e}")))?;
            headers.insert(name, value);
        }

        let timeout = Duration::from_secs(config.timeout_secs);
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            method: config.method,
            url,
            query_param: config.query_param.clone(),
            params: config
                .params
                .iter()
                .map(|(k, v)| (k.clone(), interpolate_env_vars(v)))
                .collect(),
            body: config.body.clone().unwrap_or(Value::Null),
            headers,
            result_pointer: config.result_pointer.clone(),
            save_dir: config.save_dir.clone(),
            timeout,
            http,
        })
    }

    fn fail(&self, reason: impl std::fmt::Display) -> ToolError {
        ToolError::ExecutionFailed {
            reason: format!("[{}] {reason}", self.name),
        }
    }

    /// Fixed `params` first, then the argument under `query_param` for GETs.
    fn request_url(&self, arg: &str) -> Url {
        let mut url = self.url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.params {
                pairs.append_pair(key, value);
            }
            if self.method == ImageMethod::Get {
                pairs.append_pair(&self.query_param, arg);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        url
    }

    /// Turn the selected response value into the tool's answer.
    async fn render(&self, found: &Value) -> Result<String, ToolError> {
        match found {
            Value::String(s) if s.trim().is_empty() => Err(self.fail("no results")),
            Value::String(s) if looks_like_url(s) => Ok(s.trim().to_string()),
            Value::String(s) => match &self.save_dir {
                Some(dir) => self.save_image(dir, s).await,
                None => Ok(cap_with_marker(s.trim(), MAX_OUTPUT_CHARS, "...")),
            },
            Value::Null => Err(self.fail("no results")),
            Value::Array(items) if items.is_empty() => Err(self.fail("no results")),
            other => {
                let pretty = serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string());
                Ok(cap_with_marker(&pretty, MAX_OUTPUT_CHARS, "..."))
            }
        }
    }

    /// Decode base64 image data (data URIs included) into a new PNG file.
    async fn save_image(&self, dir: &std::path::Path, data: &str) -> Result<String, ToolError> {
        let payload = match data.split_once(";base64,") {
            Some((_, rest)) => rest,
            None => data,
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| self.fail(format!("response is neither a URL nor base64 image data: {e}")))?;

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| self.fail(format!("failed to create {}: {e}", dir.display())))?;
        let path = dir.join(format!("{}-{}.png", self.name, uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| self.fail(format!("failed to write {}: {e}", path.display())))?;

        tracing::info!(tool = %self.name, path = %path.display(), bytes = bytes.len(), "image saved");
        Ok(path.display().to_string())
    }
}

fn looks_like_url(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("http://") || s.starts_with("https://")
}

/// Copy `template`, replacing `{arg}` inside every string leaf.
fn fill_template(template: &Value, arg: &str) -> Value {
    match template {
        Value::String(s) => Value::String(s.replace(ARG_PLACEHOLDER, arg)),
        Value::Array(items) => Value::Array(items.iter().map(|v| fill_template(v, arg)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), fill_template(v, arg)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[async_trait]
impl Tool for ImageTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &[ToolParam] {
        image_params()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let arg = required_arg(args, "arg")?;
        let arg = arg.trim();
        let url = self.request_url(arg);
        tracing::info!(tool = %self.name, method = ?self.method, url = %url.path(), "image request");

        let request = match self.method {
            ImageMethod::Get => self.http.get(url),
            ImageMethod::Post => self.http.post(url).json(&fill_template(&self.body, arg)),
        };
        let response = request
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout {
                        secs: self.timeout.as_secs(),
                    }
                } else {
                    self.fail(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.fail(format!("failed to read body: {e}")))?;
        if !status.is_success() {
            return Err(self.fail(format!(
                "HTTP {status}: {}",
                cap_with_marker(body.trim(), ERROR_BODY_CHARS, "...")
            )));
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| self.fail(format!("response is not JSON: {e}")))?;
        match json.pointer(&self.result_pointer) {
            Some(found) => self.render(found).await,
            None => Err(self.fail("no results")),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn search_config(url: &str) -> ImageToolConfig {
        serde_yaml::from_str(&format!(
            r#"
            name: google_images_search
            description: First image for the keywords.
            url: {url}
            params:
              searchType: image
              num: "1"
            result_pointer: /items/0/link
            "#
        ))
        .unwrap()
    }

    fn generator_config(url: &str) -> ImageToolConfig {
        serde_yaml::from_str(&format!(
            r#"
            name: stable_diffusion
            description: Generate an image from a prompt.
            method: post
            url: {url}
            body:
              prompt: "{{arg}}, highly detailed"
              n: 1
            result_pointer: /data/0/url
            "#
        ))
        .unwrap()
    }

    fn args(arg: &str) -> Map<String, Value> {
        json!({ "arg": arg }).as_object().cloned().unwrap()
    }

    /// Serve one HTTP response; hands back the raw request (head and body).
    async fn one_shot_server(
        status: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{addr}/v1/images"), handle)
    }

    /// Head received and, if a Content-Length was sent, the whole body too.
    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|l| {
                let (k, v) = l.split_once(':')?;
                k.eq_ignore_ascii_case("content-length")
                    .then(|| v.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        body.len() >= length
    }

    #[test]
    fn test_fill_template_replaces_string_leaves() {
        let template = json!({"prompt": "a {arg}", "n": 1, "tags": ["{arg}", true]});
        assert_eq!(
            fill_template(&template, "cat"),
            json!({"prompt": "a cat", "n": 1, "tags": ["cat", true]})
        );
    }

    #[test]
    fn test_request_url_appends_params_then_query() {
        let tool = ImageTool::from_config(&search_config("https://www.googleapis.com/customsearch/v1")).unwrap();
        let url = tool.request_url("red fox");
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/customsearch/v1?num=1&searchType=image&q=red+fox"
        );
    }

    #[test]
    fn test_post_without_body_rejected() {
        let mut cfg = generator_config("https://api.example/v1/images");
        cfg.body = None;
        let err = ImageTool::from_config(&cfg).err().unwrap();
        assert!(err.to_string().contains("body template"));
    }

    #[test]
    fn test_relative_pointer_rejected() {
        let mut cfg = search_config("https://api.example/search");
        cfg.result_pointer = "items/0/link".into();
        assert!(ImageTool::from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_search_returns_first_link() {
        let body = json!({"items": [{"link": "https://img.example/fox.jpg"}, {"link": "https://img.example/2.jpg"}]});
        let (url, server) = one_shot_server("200 OK", body.to_string()).await;
        let tool = ImageTool::from_config(&search_config(&url)).unwrap();

        let out = tool.call(&args("red fox")).await.unwrap();
        assert_eq!(out, "https://img.example/fox.jpg");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /v1/images?num=1&searchType=image&q=red+fox HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_search_without_results() {
        let (url, server) = one_shot_server("200 OK", r#"{"searchInformation":{}}"#.into()).await;
        let tool = ImageTool::from_config(&search_config(&url)).unwrap();

        let err = tool.call(&args("nothing")).await.unwrap_err();
        assert_eq!(err.to_string(), "[google_images_search] no results");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_generator_posts_filled_body() {
        let body = json!({"data": [{"url": "https://cdn.example/generated.png"}]});
        let (url, server) = one_shot_server("200 OK", body.to_string()).await;
        let tool = ImageTool::from_config(&generator_config(&url)).unwrap();

        let out = tool.call(&args("a lighthouse")).await.unwrap();
        assert_eq!(out, "https://cdn.example/generated.png");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/images HTTP/1.1"));
        let sent: Value = serde_json::from_str(request.split_once("\r\n\r\n").unwrap().1).unwrap();
        assert_eq!(sent, json!({"prompt": "a lighthouse, highly detailed", "n": 1}));
    }

    #[tokio::test]
    async fn test_generator_saves_base64_image() {
        let dir = tempfile::tempdir().unwrap();
        let png = [0x89u8, b'P', b'N', b'G', 1, 2, 3];
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        let body = json!({"images": [encoded]});
        let (url, server) = one_shot_server("200 OK", body.to_string()).await;

        let mut cfg = generator_config(&url);
        cfg.result_pointer = "/images/0".into();
        cfg.save_dir = Some(dir.path().to_path_buf());
        let tool = ImageTool::from_config(&cfg).unwrap();

        let out = tool.call(&args("a lighthouse")).await.unwrap();
        let path = PathBuf::from(&out);
        assert!(path.starts_with(dir.path()));
        assert!(out.ends_with(".png"));
        assert_eq!(std::fs::read(&path).unwrap(), png);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_error_quoted() {
        let (url, server) =
            one_shot_server("401 Unauthorized", r#"{"error":"bad key"}"#.into()).await;
        let tool = ImageTool::from_config(&generator_config(&url)).unwrap();

        let err = tool.call(&args("x")).await.unwrap_err();
        assert!(err.to_string().starts_with("[stable_diffusion] HTTP 401"));
        server.await.unwrap();
    }
}
