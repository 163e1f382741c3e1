use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use std::collections::BTreeMap;

use super::{Method, RawResponse, RestRequest, Transport};
use crate::config::Config;
use crate::hal::resolve_href;

const HAL_JSON: &str = "application/hal+json, application/json";

/// HTTP transport backed by reqwest
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: String,
}

impl HttpTransport {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token().ok();
    Self::with_token(&config.api.url, &config.api.headers, token.as_deref())
  }

  pub fn with_token(
    base_url: &str,
    extra_headers: &BTreeMap<String, String>,
    token: Option<&str>,
  ) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(HAL_JSON));

    if let Some(token) = token {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid API token: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    for (name, value) in extra_headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?;
      let value =
        HeaderValue::from_str(value).map_err(|e| eyre!("Invalid header value: {}", e))?;
      headers.insert(name, value);
    }

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: base_url.to_string(),
    })
  }

  /// Absolute URL for an href, relative hrefs being resolved against the
  /// configured API root.
  pub fn url_for(&self, href: &str) -> Result<String> {
    resolve_href(&self.base_url, href)
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: RestRequest) -> BoxFuture<'static, Result<RawResponse>> {
    let client = self.client.clone();
    let url = self.url_for(&request.href);

    async move {
      let url = url?;
      let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
      };

      let mut builder = client.request(method, &url);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        let body = serde_json::to_vec(body)
          .map_err(|e| eyre!("Failed to encode request body for {}: {}", url, e))?;
        builder = builder.header(CONTENT_TYPE, "application/json").body(body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to send {} {}: {}", request.method, url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
      let body = response
        .text()
        .await
        .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

      Ok(RawResponse {
        status,
        headers,
        body,
      })
    }
    .boxed()
  }
}
