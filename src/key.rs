//! Canonical query keys.
//!
//! A key is a resource kind plus a parameter bag. The bag is canonicalized on
//! construction so that the same logical query always produces the same key,
//! whatever order the parameters were supplied in and whether a number was
//! written as `2` or `"2"`.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::KeyError;

/// A canonical parameter value.
///
/// Ordering is only used to sort filter sets, it carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Param {
  Bool(bool),
  /// Decimal text in canonical form (`2`, `-3`, `2.5`).
  Number(String),
  Text(String),
  List(Vec<Param>),
  Map(BTreeMap<String, Param>),
}

impl Param {
  /// Numbers, strings and booleans as they would appear in a URL query string.
  /// Lists and maps have no scalar form.
  pub fn as_scalar(&self) -> Option<String> {
    match self {
      Param::Bool(b) => Some(b.to_string()),
      Param::Number(n) => Some(n.clone()),
      Param::Text(t) => Some(t.clone()),
      Param::List(_) | Param::Map(_) => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Param::Number(n) => n.parse().ok(),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Param::Text(t) => Some(t),
      _ => None,
    }
  }

  /// Back to JSON, used for the canonical text form.
  pub fn to_value(&self) -> Value {
    match self {
      Param::Bool(b) => Value::Bool(*b),
      Param::Number(n) => serde_json::from_str::<serde_json::Number>(n)
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(n.clone())),
      Param::Text(t) => Value::String(t.clone()),
      Param::List(items) => Value::Array(items.iter().map(Param::to_value).collect()),
      Param::Map(map) => Value::Object(
        map
          .iter()
          .map(|(k, v)| (k.clone(), v.to_value()))
          .collect::<Map<String, Value>>(),
      ),
    }
  }
}

struct KeyInner {
  kind: String,
  params: BTreeMap<String, Param>,
  canonical: String,
}

/// Canonical identifier of a cacheable, parameterized read.
///
/// Cheap to clone. Equality and hashing go through the canonical text, which
/// is unique per logical query.
#[derive(Clone)]
pub struct QueryKey {
  inner: Arc<KeyInner>,
}

impl QueryKey {
  /// Build a key from a resource kind and a JSON object of parameters.
  pub fn new(kind: impl Into<String>, params: Value) -> Result<Self, KeyError> {
    let kind = kind.into();
    if kind.trim().is_empty() {
      return Err(KeyError::EmptyKind);
    }
    let bag = match params {
      Value::Object(map) => map,
      Value::Null => Map::new(),
      other => {
        return Err(KeyError::NotAMap {
          found: json_type_name(&other),
        })
      }
    };

    let mut params = BTreeMap::new();
    for (name, value) in bag {
      if let Some(param) = canonicalize(&name, value)? {
        params.insert(name, param);
      }
    }
    Ok(Self::from_parts(kind, params))
  }

  /// Start building a key parameter by parameter.
  pub fn builder(kind: impl Into<String>) -> KeyBuilder {
    KeyBuilder {
      kind: kind.into(),
      params: Map::new(),
      error: None,
    }
  }

  /// Parse the output of [`QueryKey::canonical`].
  pub fn parse(canonical: &str) -> Result<Self, KeyError> {
    let malformed = |reason: &str| KeyError::Malformed {
      input: canonical.to_string(),
      reason: reason.to_string(),
    };
    let value: Value = serde_json::from_str(canonical).map_err(|e| malformed(&e.to_string()))?;
    match value {
      Value::Array(mut parts) if parts.len() == 2 => {
        let params = parts.pop().unwrap_or(Value::Null);
        match parts.pop() {
          Some(Value::String(kind)) => Self::new(kind, params),
          _ => Err(malformed("resource kind must be a string")),
        }
      }
      _ => Err(malformed("expected a [kind, params] pair")),
    }
  }

  fn from_parts(kind: String, params: BTreeMap<String, Param>) -> Self {
    let bag: Map<String, Value> = params
      .iter()
      .map(|(k, v)| (k.clone(), v.to_value()))
      .collect();
    // serde_json's default map is ordered, so this text is deterministic
    let canonical = Value::Array(vec![Value::String(kind.clone()), Value::Object(bag)]).to_string();
    Self {
      inner: Arc::new(KeyInner {
        kind,
        params,
        canonical,
      }),
    }
  }

  pub fn kind(&self) -> &str {
    &self.inner.kind
  }

  pub fn params(&self) -> &BTreeMap<String, Param> {
    &self.inner.params
  }

  pub fn get(&self, name: &str) -> Option<&Param> {
    self.inner.params.get(name)
  }

  /// Deterministic text form, `["kind",{...}]` with sorted parameters.
  pub fn canonical(&self) -> &str {
    &self.inner.canonical
  }

  /// SHA-256 of the canonical form, hex encoded. Stable, fixed-length.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.inner.canonical.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// `true` when `self` has the same kind and every parameter of `pattern`.
  pub fn contains(&self, pattern: &QueryKey) -> bool {
    self.kind() == pattern.kind()
      && pattern
        .params()
        .iter()
        .all(|(name, value)| self.get(name) == Some(value))
  }
}

impl PartialEq for QueryKey {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner) || self.inner.canonical == other.inner.canonical
  }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.inner.canonical.hash(state);
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.inner.canonical)
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "QueryKey({})", self.inner.canonical)
  }
}

/// Incremental key construction. The first bad parameter is reported by
/// [`KeyBuilder::build`].
pub struct KeyBuilder {
  kind: String,
  params: Map<String, Value>,
  error: Option<KeyError>,
}

impl KeyBuilder {
  /// Add a parameter. `None` and `null` values are dropped.
  pub fn param(mut self, name: &str, value: impl Serialize) -> Self {
    if self.error.is_some() {
      return self;
    }
    match serde_json::to_value(value) {
      Ok(value) => {
        self.params.insert(name.to_string(), value);
      }
      Err(e) => {
        self.error = Some(KeyError::NotSerializable {
          name: name.to_string(),
          reason: e.to_string(),
        })
      }
    }
    self
  }

  /// Add a floating point parameter, rejecting NaN and infinities.
  pub fn number(mut self, name: &str, value: f64) -> Self {
    if self.error.is_none() && !value.is_finite() {
      self.error = Some(KeyError::NonFinite {
        name: name.to_string(),
      });
      return self;
    }
    self.param(name, value)
  }

  /// Add an order-insensitive filter set: values are sorted and deduplicated.
  pub fn param_set<I, V>(mut self, name: &str, values: I) -> Self
  where
    I: IntoIterator<Item = V>,
    V: Serialize,
  {
    let mut items = Vec::new();
    for value in values {
      match serde_json::to_value(value) {
        Ok(value) => items.push(value),
        Err(e) => {
          self.error.get_or_insert(KeyError::NotSerializable {
            name: name.to_string(),
            reason: e.to_string(),
          });
          return self;
        }
      }
    }
    match canonicalize(name, Value::Array(items)) {
      Ok(Some(Param::List(mut list))) => {
        list.sort();
        list.dedup();
        self
          .params
          .insert(name.to_string(), Param::List(list).to_value());
      }
      Ok(_) => {}
      Err(e) => {
        self.error.get_or_insert(e);
      }
    }
    self
  }

  pub fn build(self) -> Result<QueryKey, KeyError> {
    if let Some(err) = self.error {
      return Err(err);
    }
    QueryKey::new(self.kind, Value::Object(self.params))
  }
}

/// Canonicalize one value. `Ok(None)` means the parameter is absent.
fn canonicalize(name: &str, value: Value) -> Result<Option<Param>, KeyError> {
  Ok(match value {
    Value::Null => None,
    Value::Bool(b) => Some(Param::Bool(b)),
    Value::Number(n) => Some(Param::Number(canonical_number(name, &n)?)),
    Value::String(s) => Some(match numeric_text(&s) {
      Some(n) => Param::Number(n),
      None => Param::Text(s),
    }),
    Value::Array(items) => {
      let mut list: Vec<Param> = Vec::with_capacity(items.len());
      for item in items {
        if let Some(param) = canonicalize(name, item)? {
          if !list.contains(&param) {
            list.push(param);
          }
        }
      }
      Some(Param::List(list))
    }
    Value::Object(map) => {
      let mut nested = BTreeMap::new();
      for (k, v) in map {
        let path = format!("{name}.{k}");
        if let Some(param) = canonicalize(&path, v)? {
          nested.insert(k, param);
        }
      }
      if nested.is_empty() {
        None
      } else {
        Some(Param::Map(nested))
      }
    }
  })
}

fn canonical_number(name: &str, n: &serde_json::Number) -> Result<String, KeyError> {
  if let Some(i) = n.as_i64() {
    return Ok(i.to_string());
  }
  if let Some(u) = n.as_u64() {
    return Ok(u.to_string());
  }
  let f = n.as_f64().ok_or_else(|| KeyError::NonFinite {
    name: name.to_string(),
  })?;
  if !f.is_finite() {
    return Err(KeyError::NonFinite {
      name: name.to_string(),
    });
  }
  Ok(format_float(f))
}

fn format_float(f: f64) -> String {
  if f.fract() == 0.0 && f.abs() < 9.0e15 {
    // integral floats share the integer form: 2.0 == 2
    format!("{}", f as i64)
  } else {
    format!("{f}")
  }
}

/// Canonical number text for strings that spell a plain decimal number.
///
/// Leading zeros, signs other than `-`, exponents and whitespace keep the
/// value as text, so identifiers such as `"007"` are not rewritten.
fn numeric_text(s: &str) -> Option<String> {
  let digits = s.strip_prefix('-').unwrap_or(s);
  let (int_part, frac_part) = match digits.split_once('.') {
    Some((i, f)) => (i, Some(f)),
    None => (digits, None),
  };
  let int_ok = !int_part.is_empty()
    && int_part.bytes().all(|b| b.is_ascii_digit())
    && (int_part == "0" || !int_part.starts_with('0'));
  let frac_ok = frac_part.map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()));
  if !int_ok || !frac_ok {
    return None;
  }
  match frac_part {
    None => s.parse::<i64>().ok().map(|i| i.to_string()),
    Some(_) => s.parse::<f64>().ok().filter(|f| f.is_finite()).map(format_float),
  }
}

fn json_type_name(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

/// Selects cache entries for invalidation.
#[derive(Clone)]
pub enum KeyMatcher {
  All,
  Exact(QueryKey),
  /// Every key of a resource kind.
  Kind(String),
  /// Same kind and every parameter of the pattern.
  Partial(QueryKey),
  Predicate(Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>),
}

impl KeyMatcher {
  pub fn kind(kind: impl Into<String>) -> Self {
    Self::Kind(kind.into())
  }

  pub fn predicate<F>(f: F) -> Self
  where
    F: Fn(&QueryKey) -> bool + Send + Sync + 'static,
  {
    Self::Predicate(Arc::new(f))
  }

  pub fn matches(&self, key: &QueryKey) -> bool {
    match self {
      Self::All => true,
      Self::Exact(exact) => exact == key,
      Self::Kind(kind) => key.kind() == kind,
      Self::Partial(pattern) => key.contains(pattern),
      Self::Predicate(f) => f(key),
    }
  }
}

impl From<QueryKey> for KeyMatcher {
  fn from(key: QueryKey) -> Self {
    Self::Exact(key)
  }
}

impl From<&QueryKey> for KeyMatcher {
  fn from(key: &QueryKey) -> Self {
    Self::Exact(key.clone())
  }
}

impl fmt::Debug for KeyMatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::All => f.write_str("All"),
      Self::Exact(key) => f.debug_tuple("Exact").field(key).finish(),
      Self::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
      Self::Partial(key) => f.debug_tuple("Partial").field(key).finish(),
      Self::Predicate(_) => f.write_str("Predicate(..)"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_insertion_order_does_not_matter() {
    let a = QueryKey::builder("pesantren-list")
      .param("page", 1)
      .param("search", "tahfidz")
      .param("filter", json!({"province": "Jawa Barat", "city": "Bandung"}))
      .build()
      .unwrap();
    let b = QueryKey::builder("pesantren-list")
      .param("filter", json!({"city": "Bandung", "province": "Jawa Barat"}))
      .param("search", "tahfidz")
      .param("page", 1)
      .build()
      .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.canonical(), b.canonical());
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_numeric_strings_match_numbers() {
    let a = QueryKey::new("news-list", json!({"page": "2", "limit": 10.0})).unwrap();
    let b = QueryKey::new("news-list", json!({"page": 2, "limit": "10"})).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.get("page").and_then(Param::as_i64), Some(2));
  }

  #[test]
  fn test_leading_zero_stays_text() {
    let key = QueryKey::new("pesantren-detail", json!({"id": "007"})).unwrap();
    assert_eq!(key.get("id"), Some(&Param::Text("007".into())));
  }

  #[test]
  fn test_absent_values_are_dropped() {
    let a = QueryKey::builder("pesantren-list")
      .param("page", 1)
      .param("search", None::<String>)
      .param("filter", json!({"province": null}))
      .build()
      .unwrap();
    let b = QueryKey::new("pesantren-list", json!({"page": 1})).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn test_lists_keep_order_and_drop_repeats() {
    let key = QueryKey::new("pesantren-list", json!({"sort": ["rating", "name", "rating"]})).unwrap();
    assert_eq!(
      key.get("sort"),
      Some(&Param::List(vec![
        Param::Text("rating".into()),
        Param::Text("name".into())
      ]))
    );

    let reversed = QueryKey::new("pesantren-list", json!({"sort": ["name", "rating"]})).unwrap();
    assert_ne!(key, reversed);
  }

  #[test]
  fn test_filter_sets_ignore_order() {
    let a = QueryKey::builder("pesantren-list")
      .param_set("programs", ["tahfidz", "kitab", "tahfidz"])
      .build()
      .unwrap();
    let b = QueryKey::builder("pesantren-list")
      .param_set("programs", ["kitab", "tahfidz"])
      .build()
      .unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn test_invalid_bags_are_rejected() {
    assert_eq!(
      QueryKey::new("", json!({})).unwrap_err(),
      KeyError::EmptyKind
    );
    assert!(matches!(
      QueryKey::new("news-list", json!([1, 2])),
      Err(KeyError::NotAMap { .. })
    ));
    assert!(matches!(
      QueryKey::builder("pesantren-list").number("min_rating", f64::NAN).build(),
      Err(KeyError::NonFinite { .. })
    ));

    let mut bad = std::collections::HashMap::new();
    bad.insert((1, 2), "tuple keys cannot become JSON");
    assert!(matches!(
      QueryKey::builder("pesantren-list").param("filter", bad).build(),
      Err(KeyError::NotSerializable { .. })
    ));
  }

  #[test]
  fn test_canonical_round_trip() {
    let key = QueryKey::new(
      "reviews",
      json!({"pesantrenId": "X", "page": 3, "sort": ["-created_at"]}),
    )
    .unwrap();
    assert_eq!(
      key.canonical(),
      r#"["reviews",{"page":3,"pesantrenId":"X","sort":["-created_at"]}]"#
    );
    assert_eq!(QueryKey::parse(key.canonical()).unwrap(), key);
    assert!(matches!(
      QueryKey::parse("not json"),
      Err(KeyError::Malformed { .. })
    ));
  }

  #[test]
  fn test_matchers() {
    let key = QueryKey::new("reviews", json!({"pesantrenId": "X", "page": 2})).unwrap();
    let pattern = QueryKey::new("reviews", json!({"pesantrenId": "X"})).unwrap();
    let other = QueryKey::new("reviews", json!({"pesantrenId": "Y"})).unwrap();

    assert!(KeyMatcher::Partial(pattern.clone()).matches(&key));
    assert!(!KeyMatcher::Partial(other).matches(&key));
    assert!(KeyMatcher::kind("reviews").matches(&key));
    assert!(!KeyMatcher::Exact(pattern).matches(&key));
    assert!(KeyMatcher::predicate(|k| k.get("page").is_some()).matches(&key));
    assert!(KeyMatcher::All.matches(&key));
  }
}
