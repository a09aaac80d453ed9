//! The slice of the URL-map resource this daemon reads and writes.
//!
//! Only the routing fields are modeled; everything else the API returns is
//! kept in an opaque overflow map so a read-modify-write never strips fields
//! (the `fingerprint` in particular must round-trip for optimistic locking).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UrlMap {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default_service: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub host_rules: Vec<HostRule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path_matchers: Vec<PathMatcher>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostRule {
    pub hosts: Vec<String>,
    pub path_matcher: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathMatcher {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default_service: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path_rules: Vec<PathRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathRule {
    pub paths: Vec<String>,
    pub service: String,
}

/// Ensures the map routes `host`/`path` to `backend_link`.
///
/// The path matcher is named after the first label of the host
/// (`api.example.com` → `api`). A path of exactly `/` routes through the
/// matcher's default service and produces no path rule; any other path gets a
/// `[path, path/*]` rule pair, with one trailing slash trimmed first.
///
/// Returns whether the map was modified and needs to be written back.
/// Matchers, host rules and path rules that already exist are left untouched,
/// so repeating an update is a no-op while two groups sharing a host can both
/// land their rules.
pub fn ensure_route(map: &mut UrlMap, backend_link: &str, host: &str, path: &str) -> bool {
    let matcher_name = host.split('.').next().unwrap_or(host).to_string();
    let mut changed = false;

    match map
        .path_matchers
        .iter()
        .position(|matcher| matcher.name == matcher_name)
    {
        None => {
            let default_service = if path == "/" {
                backend_link.to_string()
            } else {
                map.default_service.clone()
            };
            map.path_matchers.push(PathMatcher {
                name: matcher_name.clone(),
                default_service,
                path_rules: path_rule(path, backend_link).into_iter().collect(),
            });
            changed = true;
        }
        Some(index) => {
            if let Some(rule) = path_rule(path, backend_link) {
                let matcher = &mut map.path_matchers[index];
                let already_routed = matcher
                    .path_rules
                    .iter()
                    .any(|existing| existing.paths.iter().any(|p| rule.paths.contains(p)));
                if !already_routed {
                    matcher.path_rules.push(rule);
                    changed = true;
                }
            }
        }
    }

    let host_known = map
        .host_rules
        .iter()
        .any(|rule| rule.hosts.iter().any(|h| h == host));
    if !host_known {
        map.host_rules.push(HostRule {
            hosts: vec![host.to_string()],
            path_matcher: matcher_name,
            description: host.to_string(),
        });
        changed = true;
    }

    changed
}

fn path_rule(path: &str, backend_link: &str) -> Option<PathRule> {
    if path == "/" {
        return None;
    }
    let path = path.strip_suffix('/').unwrap_or(path);
    Some(PathRule {
        paths: vec![path.to_string(), format!("{}/*", path)],
        service: backend_link.to_string(),
    })
}
