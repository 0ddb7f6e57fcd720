//! REST adapter for the pesantren directory API.
//!
//! Maps a query key to a `GET` request: the resource kind picks a route
//! template, path placeholders such as `{id}` are filled from the key's
//! parameters and the remaining parameters become the query string.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::key::{Param, QueryKey};

/// Resource kind to route template.
pub const DEFAULT_ROUTES: &[(&str, &str)] = &[
  ("pesantren-list", "/pesantren"),
  ("pesantren-featured", "/pesantren/featured"),
  ("pesantren-popular", "/pesantren/popular"),
  ("pesantren-stats", "/pesantren/stats"),
  ("pesantren-detail", "/pesantren/{id}"),
  ("reviews", "/reviews/pesantren/{pesantrenId}"),
  ("reviews-by-user", "/reviews/user/{userId}"),
  ("review-list", "/reviews"),
  ("review-stats", "/reviews/stats"),
  ("review-detail", "/reviews/{id}"),
  ("news-list", "/news"),
  ("news-featured", "/news/featured"),
  ("news-popular", "/news/popular"),
  ("news-categories", "/news/categories"),
  ("news-tags", "/news/tags"),
  ("news-slug", "/news/slug/{slug}"),
  ("news-detail", "/news/{id}"),
  ("news-related", "/news/{id}/related"),
  ("news-stats", "/news/stats"),
  ("consultation-list", "/consultations"),
  ("consultation-stats", "/consultations/stats"),
  ("consultation-analytics", "/consultations/analytics"),
  ("consultation-categories", "/consultations/categories"),
  ("consultation-detail", "/consultations/{id}"),
  ("consultation-responses", "/consultations/{id}/responses"),
  ("application-list", "/applications"),
  ("application-stats", "/applications/stats"),
  ("applications-by-pesantren", "/applications/pesantren/{pesantrenId}"),
  ("applications-by-user", "/applications/user/{userId}"),
  ("application-detail", "/applications/{id}"),
  ("application-documents", "/applications/{id}/documents"),
  ("about-us", "/about-us"),
];

/// Pagination block of a collection response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
  #[serde(default = "first_page")]
  pub page: u32,
  #[serde(default = "default_limit")]
  pub limit: u32,
  #[serde(default)]
  pub total: Option<u64>,
  #[serde(default)]
  pub total_pages: Option<u64>,
  #[serde(default)]
  pub has_next: Option<bool>,
  #[serde(default)]
  pub has_prev: Option<bool>,
}

fn first_page() -> u32 {
  1
}

fn default_limit() -> u32 {
  10
}

/// A paginated collection: `{ "data": [...], "pagination": {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
  pub data: Vec<T>,
  pub pagination: PaginationMeta,
}

impl<T: serde::de::DeserializeOwned> Page<T> {
  pub fn from_value(value: &Value) -> Result<Self, FetchError> {
    Self::deserialize(value).map_err(|e| FetchError::Decode(e.to_string()))
  }
}

/// Append `item` to a cached collection, for optimistic inserts. Works on
/// paginated bodies and on plain arrays. The total count is bumped.
pub fn append_to_page(cached: Option<&Value>, item: &Value) -> Value {
  match cached {
    Some(Value::Array(items)) => {
      let mut items = items.clone();
      items.push(item.clone());
      Value::Array(items)
    }
    Some(Value::Object(body)) if body.get("data").is_some_and(Value::is_array) => {
      let mut body = body.clone();
      if let Some(Value::Array(items)) = body.get_mut("data") {
        items.push(item.clone());
      }
      if let Some(total) = body
        .get_mut("pagination")
        .and_then(|p| p.get_mut("total"))
      {
        if let Some(n) = total.as_u64() {
          *total = Value::from(n + 1);
        }
      }
      Value::Object(body)
    }
    _ => Value::Array(vec![item.clone()]),
  }
}

/// Replace the element of a cached collection whose `id` equals `item`'s, or
/// append it when there is none.
pub fn upsert_in_page(cached: Option<&Value>, item: &Value) -> Value {
  let id = item.get("id");
  let replace = |items: &mut Vec<Value>| -> bool {
    match items
      .iter_mut()
      .find(|existing| id.is_some() && existing.get("id") == id)
    {
      Some(existing) => {
        *existing = item.clone();
        true
      }
      None => false,
    }
  };

  match cached {
    Some(Value::Array(items)) => {
      let mut items = items.clone();
      if !replace(&mut items) {
        items.push(item.clone());
      }
      Value::Array(items)
    }
    Some(Value::Object(body)) if body.get("data").is_some_and(Value::is_array) => {
      let mut body = body.clone();
      let mut replaced = false;
      if let Some(Value::Array(items)) = body.get_mut("data") {
        replaced = replace(items);
      }
      if replaced {
        Value::Object(body)
      } else {
        append_to_page(Some(&Value::Object(body)), item)
      }
    }
    _ => Value::Array(vec![item.clone()]),
  }
}

/// HTTP client for the directory API, usable as a [`Fetcher`].
///
/// Cheap to clone.
#[derive(Clone)]
pub struct RestClient {
  http: reqwest::Client,
  base: Url,
  token: Option<String>,
  routes: Arc<HashMap<String, String>>,
  timeout: Duration,
}

impl RestClient {
  /// Client for the API at `base`. Requests give up after `timeout`.
  pub fn new(base: Url, timeout: Duration) -> Result<Self, FetchError> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("pondok/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| FetchError::Transport(e.to_string()))?;

    let routes = DEFAULT_ROUTES
      .iter()
      .map(|(kind, route)| (kind.to_string(), route.to_string()))
      .collect();

    Ok(Self {
      http,
      base,
      token: None,
      routes: Arc::new(routes),
      timeout,
    })
  }

  /// Send `Authorization: Bearer <token>` with every request.
  #[must_use]
  pub fn with_token(mut self, token: impl Into<String>) -> Self {
    self.token = Some(token.into());
    self
  }

  /// Add or override the route template of a resource kind.
  #[must_use]
  pub fn with_route(mut self, kind: impl Into<String>, template: impl Into<String>) -> Self {
    Arc::make_mut(&mut self.routes).insert(kind.into(), template.into());
    self
  }

  pub fn base(&self) -> &Url {
    &self.base
  }

  /// URL a key is fetched from.
  pub fn url_for(&self, key: &QueryKey) -> Result<Url, FetchError> {
    let template = self.routes.get(key.kind()).ok_or_else(|| {
      FetchError::InvalidRequest(format!("no route for resource kind `{}`", key.kind()))
    })?;

    let mut used = Vec::new();
    let mut segments = Vec::new();
    for segment in template.split('/').filter(|s| !s.is_empty()) {
      match segment
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
      {
        Some(name) => {
          let value = key
            .get(name)
            .and_then(Param::as_scalar)
            .ok_or_else(|| {
              FetchError::InvalidRequest(format!("`{}` needs a `{name}` parameter", key.kind()))
            })?;
          used.push(name);
          segments.push(value);
        }
        None => segments.push(segment.to_string()),
      }
    }

    let mut url = self.endpoint_from(&segments)?;

    let mut pairs = Vec::new();
    for (name, param) in key.params() {
      if !used.contains(&name.as_str()) {
        query_pairs(name, param, &mut pairs);
      }
    }
    if !pairs.is_empty() {
      url.query_pairs_mut().extend_pairs(&pairs);
    }
    Ok(url)
  }

  /// URL of a write endpoint relative to the base, e.g. `/reviews`.
  pub fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
    let segments: Vec<String> = path
      .split('/')
      .filter(|s| !s.is_empty())
      .map(str::to_string)
      .collect();
    self.endpoint_from(&segments)
  }

  fn endpoint_from(&self, segments: &[String]) -> Result<Url, FetchError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| FetchError::InvalidRequest(format!("base url {} cannot hold a path", self.base)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  /// Fetch the resource behind `key`.
  pub async fn get(&self, key: &QueryKey) -> Result<Value, FetchError> {
    let url = self.url_for(key)?;
    debug!(key = %key, url = %url, "GET");
    self.send(self.request(Method::GET, url)).await
  }

  pub async fn post(&self, path: &str, body: &Value) -> Result<Value, FetchError> {
    self.write(Method::POST, path, Some(body)).await
  }

  pub async fn put(&self, path: &str, body: &Value) -> Result<Value, FetchError> {
    self.write(Method::PUT, path, Some(body)).await
  }

  pub async fn patch(&self, path: &str, body: &Value) -> Result<Value, FetchError> {
    self.write(Method::PATCH, path, Some(body)).await
  }

  pub async fn delete(&self, path: &str) -> Result<Value, FetchError> {
    self.write(Method::DELETE, path, None).await
  }

  async fn write(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, FetchError> {
    let url = self.endpoint(path)?;
    debug!(url = %url, %method, "write");
    let mut request = self.request(method, url);
    if let Some(body) = body {
      request = request.json(body);
    }
    self.send(request).await
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let request = self
      .http
      .request(method, url)
      .header(reqwest::header::ACCEPT, "application/json");
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn send(&self, request: RequestBuilder) -> Result<Value, FetchError> {
    let response = request.send().await.map_err(|e| self.map_error(e))?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(|e| self.map_error(e))?;

    if !status.is_success() {
      let body = serde_json::from_slice::<Value>(&bytes).ok();
      return Err(FetchError::Status {
        status: status.as_u16(),
        message: error_message(body.as_ref())
          .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string()),
      });
    }

    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    let body: Value =
      serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))?;
    Ok(unwrap_envelope(body))
  }

  fn map_error(&self, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
      FetchError::Timeout(self.timeout)
    } else if err.is_decode() {
      FetchError::Decode(err.to_string())
    } else {
      FetchError::Transport(err.to_string())
    }
  }
}

impl Fetcher for RestClient {
  fn fetch(&self, key: &QueryKey) -> BoxFuture<'static, Result<Value, FetchError>> {
    let client = self.clone();
    let key = key.clone();
    async move { client.get(&key).await }.boxed()
  }
}

impl std::fmt::Debug for RestClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RestClient")
      .field("base", &self.base.as_str())
      .field("routes", &self.routes.len())
      .field("timeout", &self.timeout)
      .finish_non_exhaustive()
  }
}

/// Query string pairs of one parameter. Maps flatten to their leaf names,
/// lists repeat the name once per item.
fn query_pairs(name: &str, param: &Param, out: &mut Vec<(String, String)>) {
  match param {
    Param::Map(map) => {
      for (leaf, value) in map {
        query_pairs(leaf, value, out);
      }
    }
    Param::List(items) => {
      for item in items {
        query_pairs(name, item, out);
      }
    }
    scalar => {
      if let Some(value) = scalar.as_scalar() {
        out.push((name.to_string(), value));
      }
    }
  }
}

/// The server puts its message in `message`, `error` or FastAPI's `detail`.
fn error_message(body: Option<&Value>) -> Option<String> {
  let body = body?;
  ["message", "error", "detail"]
    .iter()
    .find_map(|field| body.get(field).and_then(Value::as_str))
    .map(str::to_string)
}

/// `{ "success": true, "data": ... }` becomes its data. Paginated bodies keep
/// their pagination block and are returned whole.
fn unwrap_envelope(body: Value) -> Value {
  match body {
    Value::Object(mut map)
      if map.get("success").is_some_and(Value::is_boolean)
        && map.contains_key("data")
        && !map.contains_key("pagination") =>
    {
      map.remove("data").unwrap_or(Value::Null)
    }
    other => other,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn client() -> RestClient {
    RestClient::new(
      Url::parse("https://api.pondok.test/api/v1/").unwrap(),
      Duration::from_secs(5),
    )
    .unwrap()
  }

  #[test]
  fn test_list_url_flattens_filters() {
    let key = QueryKey::new(
      "pesantren-list",
      json!({
        "page": 1,
        "limit": 20,
        "filter": {"province": "Jawa Barat", "type": "salaf"},
      }),
    )
    .unwrap();

    let url = client().url_for(&key).unwrap();
    assert_eq!(url.path(), "/api/v1/pesantren");
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert_eq!(
      pairs,
      vec![
        ("province".to_string(), "Jawa Barat".to_string()),
        ("type".to_string(), "salaf".to_string()),
        ("limit".to_string(), "20".to_string()),
        ("page".to_string(), "1".to_string()),
      ]
    );
  }

  #[test]
  fn test_path_placeholders_are_filled() {
    let key = QueryKey::new("reviews", json!({"pesantrenId": "X", "page": 2})).unwrap();
    let url = client().url_for(&key).unwrap();
    assert_eq!(url.as_str(), "https://api.pondok.test/api/v1/reviews/pesantren/X?page=2");

    let key = QueryKey::new("news-detail", json!({"id": "42"})).unwrap();
    let url = client().url_for(&key).unwrap();
    assert_eq!(url.as_str(), "https://api.pondok.test/api/v1/news/42");
  }

  #[test]
  fn test_consultation_application_and_user_routes() {
    let cases = [
      (
        json!({"id": "c1"}),
        "consultation-responses",
        "https://api.pondok.test/api/v1/consultations/c1/responses",
      ),
      (
        json!({"status": "pending"}),
        "consultation-list",
        "https://api.pondok.test/api/v1/consultations?status=pending",
      ),
      (
        json!({"pesantrenId": "p9", "page": 1}),
        "applications-by-pesantren",
        "https://api.pondok.test/api/v1/applications/pesantren/p9?page=1",
      ),
      (
        json!({"id": "a3"}),
        "application-documents",
        "https://api.pondok.test/api/v1/applications/a3/documents",
      ),
      (
        json!({"userId": "u7"}),
        "reviews-by-user",
        "https://api.pondok.test/api/v1/reviews/user/u7",
      ),
      (json!({}), "review-stats", "https://api.pondok.test/api/v1/reviews/stats"),
      (json!({}), "news-stats", "https://api.pondok.test/api/v1/news/stats"),
      (json!({}), "about-us", "https://api.pondok.test/api/v1/about-us"),
    ];
    for (params, kind, expected) in cases {
      let key = QueryKey::new(kind, params).unwrap();
      assert_eq!(client().url_for(&key).unwrap().as_str(), expected, "{kind}");
    }
  }

  #[test]
  fn test_lists_repeat_the_name() {
    let key = QueryKey::builder("news-list")
      .param_set("tags", ["santri", "kajian"])
      .build()
      .unwrap();
    let url = client().url_for(&key).unwrap();
    assert_eq!(url.query(), Some("tags=kajian&tags=santri"));
  }

  #[test]
  fn test_route_errors_are_terminal() {
    let unknown = QueryKey::new("donations", json!({})).unwrap();
    let err = client().url_for(&unknown).unwrap_err();
    assert!(matches!(err, FetchError::InvalidRequest(_)));
    assert!(!err.is_retryable());

    let missing = QueryKey::new("pesantren-detail", json!({})).unwrap();
    assert!(matches!(
      client().url_for(&missing),
      Err(FetchError::InvalidRequest(_))
    ));
  }

  #[test]
  fn test_route_override() {
    let key = QueryKey::new("donations", json!({"page": 1})).unwrap();
    let url = client()
      .with_route("donations", "/donations")
      .url_for(&key)
      .unwrap();
    assert_eq!(url.path(), "/api/v1/donations");

    // overrides win over the defaults
    let key = QueryKey::new("about-us", json!({})).unwrap();
    let url = client()
      .with_route("about-us", "/pages/about")
      .url_for(&key)
      .unwrap();
    assert_eq!(url.path(), "/api/v1/pages/about");
  }

  #[test]
  fn test_error_message_fields() {
    assert_eq!(
      error_message(Some(&json!({"success": false, "message": "Pesantren not found"}))),
      Some("Pesantren not found".to_string())
    );
    assert_eq!(
      error_message(Some(&json!({"detail": "Not authenticated"}))),
      Some("Not authenticated".to_string())
    );
    assert_eq!(error_message(Some(&json!({"code": 1}))), None);
    assert_eq!(error_message(None), None);
  }

  #[test]
  fn test_envelope_unwrapping() {
    assert_eq!(
      unwrap_envelope(json!({"success": true, "message": "ok", "data": {"id": 1}})),
      json!({"id": 1})
    );
    let page = json!({"data": [], "pagination": {"page": 1, "limit": 10}, "success": true});
    assert_eq!(unwrap_envelope(page.clone()), page);
  }

  #[test]
  fn test_page_decoding() {
    let body = json!({
      "data": [{"id": "a"}, {"id": "b"}],
      "pagination": {"page": 1, "limit": 10, "total": 2, "total_pages": 1, "has_next": false},
    });
    let page: Page<Value> = Page::from_value(&body).unwrap();
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.pagination.total, Some(2));
    assert_eq!(page.pagination.has_prev, None);
  }

  #[test]
  fn test_append_and_upsert() {
    let body = json!({"data": [{"id": 1}], "pagination": {"page": 1, "limit": 10, "total": 1}});

    let appended = append_to_page(Some(&body), &json!({"id": 2}));
    assert_eq!(appended["data"], json!([{"id": 1}, {"id": 2}]));
    assert_eq!(appended["pagination"]["total"], json!(2));

    let upserted = upsert_in_page(Some(&appended), &json!({"id": 2, "rating": 5}));
    assert_eq!(upserted["data"], json!([{"id": 1}, {"id": 2, "rating": 5}]));
    assert_eq!(upserted["pagination"]["total"], json!(2));

    assert_eq!(append_to_page(None, &json!(1)), json!([1]));
  }
}
