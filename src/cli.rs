//! Resource kinds known to the command line and parsing of `name=value`
//! parameters into a query key.

use color_eyre::{eyre::eyre, Result};
use pondok::QueryKey;
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct ResourceKind {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All resource kinds with a default route
pub const RESOURCE_KINDS: &[ResourceKind] = &[
  ResourceKind {
    name: "pesantren-list",
    aliases: &["p", "pesantren"],
    description: "Search and filter pesantren",
  },
  ResourceKind {
    name: "pesantren-detail",
    aliases: &["pd"],
    description: "One pesantren by id",
  },
  ResourceKind {
    name: "pesantren-featured",
    aliases: &["featured"],
    description: "Featured pesantren",
  },
  ResourceKind {
    name: "pesantren-popular",
    aliases: &["popular"],
    description: "Most viewed pesantren",
  },
  ResourceKind {
    name: "pesantren-stats",
    aliases: &["stats"],
    description: "Directory statistics",
  },
  ResourceKind {
    name: "reviews",
    aliases: &["r", "review"],
    description: "Reviews of one pesantren (pesantrenId=...)",
  },
  ResourceKind {
    name: "reviews-by-user",
    aliases: &["ru"],
    description: "Reviews written by one user (userId=...)",
  },
  ResourceKind {
    name: "review-stats",
    aliases: &[],
    description: "Review statistics",
  },
  ResourceKind {
    name: "review-list",
    aliases: &["rl"],
    description: "All reviews",
  },
  ResourceKind {
    name: "review-detail",
    aliases: &["rd"],
    description: "One review by id",
  },
  ResourceKind {
    name: "news-list",
    aliases: &["n", "news"],
    description: "News and announcements",
  },
  ResourceKind {
    name: "news-detail",
    aliases: &["nd"],
    description: "One news article by id",
  },
  ResourceKind {
    name: "news-slug",
    aliases: &["slug"],
    description: "One news article by slug",
  },
  ResourceKind {
    name: "news-related",
    aliases: &["related"],
    description: "Articles related to a news id",
  },
  ResourceKind {
    name: "news-featured",
    aliases: &[],
    description: "Featured news",
  },
  ResourceKind {
    name: "news-popular",
    aliases: &[],
    description: "Most read news",
  },
  ResourceKind {
    name: "news-categories",
    aliases: &["categories"],
    description: "News categories",
  },
  ResourceKind {
    name: "news-tags",
    aliases: &["tags"],
    description: "News tags",
  },
  ResourceKind {
    name: "news-stats",
    aliases: &[],
    description: "News statistics",
  },
  ResourceKind {
    name: "consultation-list",
    aliases: &["c", "consultations"],
    description: "Consultation requests",
  },
  ResourceKind {
    name: "consultation-detail",
    aliases: &["cd"],
    description: "One consultation by id",
  },
  ResourceKind {
    name: "consultation-responses",
    aliases: &["responses"],
    description: "Responses to a consultation id",
  },
  ResourceKind {
    name: "consultation-stats",
    aliases: &[],
    description: "Consultation statistics",
  },
  ResourceKind {
    name: "consultation-analytics",
    aliases: &["analytics"],
    description: "Consultation trends",
  },
  ResourceKind {
    name: "consultation-categories",
    aliases: &[],
    description: "Consultation categories",
  },
  ResourceKind {
    name: "application-list",
    aliases: &["a", "applications"],
    description: "Enrollment applications",
  },
  ResourceKind {
    name: "application-detail",
    aliases: &["ad"],
    description: "One application by id",
  },
  ResourceKind {
    name: "applications-by-pesantren",
    aliases: &["ap"],
    description: "Applications to one pesantren (pesantrenId=...)",
  },
  ResourceKind {
    name: "applications-by-user",
    aliases: &["au"],
    description: "Applications of one user (userId=...)",
  },
  ResourceKind {
    name: "application-documents",
    aliases: &["documents"],
    description: "Documents attached to an application id",
  },
  ResourceKind {
    name: "application-stats",
    aliases: &[],
    description: "Application statistics",
  },
  ResourceKind {
    name: "about-us",
    aliases: &["about"],
    description: "About page content",
  },
];

/// Kinds matching `input`, best match first
pub fn get_suggestions(input: &str) -> Vec<&'static ResourceKind> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return RESOURCE_KINDS.iter().collect();
  }

  let mut matches: Vec<(&ResourceKind, u32)> = Vec::new();

  for kind in RESOURCE_KINDS {
    let priority = if kind.name == input_lower {
      0
    } else if kind.aliases.contains(&input_lower.as_str()) {
      1
    } else if kind.name.starts_with(&input_lower) {
      2
    } else if kind.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      3
    } else if kind.name.contains(&input_lower) {
      4
    } else {
      continue;
    };
    matches.push((kind, priority));
  }

  matches.sort_by_key(|(_, priority)| *priority);
  matches.into_iter().map(|(kind, _)| kind).collect()
}

/// Resolve a name or alias to its kind. Unknown names are passed through so
/// routes added in the config file work too.
pub fn resolve_kind(input: &str) -> &str {
  match get_suggestions(input).first() {
    Some(kind) if kind.name == input || kind.aliases.contains(&input) => kind.name,
    _ => input,
  }
}

/// Build a parameter bag from `name=value` arguments.
///
/// - `filter.province=Jawa Barat` nests into `{"filter": {"province": ...}}`
/// - repeating a name collects the values into a list
/// - `true`/`false` become booleans, everything else stays text and is
///   normalized by the key (so `page=2` equals `page: 2`)
pub fn parse_params(args: &[String]) -> Result<Value> {
  let mut bag = Map::new();
  for arg in args {
    let (path, raw) = arg
      .split_once('=')
      .ok_or_else(|| eyre!("Expected name=value, got `{}`", arg))?;
    if path.is_empty() {
      return Err(eyre!("Missing parameter name in `{}`", arg));
    }

    let value = match raw {
      "true" => Value::Bool(true),
      "false" => Value::Bool(false),
      _ => Value::String(raw.to_string()),
    };
    insert_path(&mut bag, path, value)?;
  }
  Ok(Value::Object(bag))
}

fn insert_path(bag: &mut Map<String, Value>, path: &str, value: Value) -> Result<()> {
  let (head, rest) = match path.split_once('.') {
    Some((head, rest)) => (head, Some(rest)),
    None => (path, None),
  };

  match rest {
    Some(rest) => {
      let child = bag
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
      match child {
        Value::Object(map) => insert_path(map, rest, value),
        _ => Err(eyre!("`{}` is both a value and a group", head)),
      }
    }
    None => {
      match bag.get_mut(head) {
        None => {
          bag.insert(head.to_string(), value);
        }
        Some(Value::Array(items)) => items.push(value),
        Some(Value::Object(_)) => return Err(eyre!("`{}` is both a value and a group", head)),
        Some(existing) => {
          let first = existing.take();
          *existing = Value::Array(vec![first, value]);
        }
      }
      Ok(())
    }
  }
}

/// Query key for `kind` (name or alias) and `name=value` arguments.
pub fn build_key(kind: &str, args: &[String]) -> Result<QueryKey> {
  let params = parse_params(args)?;
  QueryKey::new(resolve_kind(kind), params).map_err(|e| eyre!("Invalid query: {}", e))
}
