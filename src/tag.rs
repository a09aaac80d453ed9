//! Routing-tag syntax and the resource names derived from it.
//!
//! A routing tag looks like `urlprefix-cdn:noaffinity:api.example.com/` and
//! decodes into CDN on/off, a session-affinity mode, a virtual host and a URL
//! path. Services that share a tag share the cloud resources named after its
//! group key. This module is the only place the tag grammar exists.

use regex::Regex;

use crate::errors::{DaemonError, Result};

/// Cloud resource names are capped at 63 characters and must start and end
/// with an alphanumeric character.
pub const MAX_RESOURCE_NAME_LEN: usize = 63;

/// Session-affinity mode carried by a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    None,
    ClientIp,
    ClientIpPort,
}

impl Affinity {
    /// Literal used inside group keys and resource names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Affinity::None => "none",
            Affinity::ClientIp => "ip",
            Affinity::ClientIpPort => "ipport",
        }
    }

    /// The compute API's `sessionAffinity` enum value.
    pub fn session_affinity(&self) -> &'static str {
        match self {
            Affinity::None => "NONE",
            Affinity::ClientIp => "CLIENT_IP",
            Affinity::ClientIpPort => "CLIENT_IP_PORT",
        }
    }
}

/// A decoded routing tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub raw: String,
    pub cdn: bool,
    pub affinity: Affinity,
    pub host: String,
    pub path: String,
}

impl TagInfo {
    /// Canonical group key: `<cdn|nocdn>-<affinity>-<host with '.' → '-'>`.
    ///
    /// A pure function of the tag, so two services carrying the same tag
    /// resolve to the same NEG, health check and backend service.
    pub fn group(&self) -> String {
        let cdn = if self.cdn { "cdn" } else { "nocdn" };
        format!(
            "{}-{}-{}",
            cdn,
            self.affinity.as_str(),
            self.host.replace('.', "-")
        )
    }
}

/// Parser for routing tags with a fixed prefix.
pub struct TagParser {
    pattern: Regex,
}

impl TagParser {
    pub fn new(prefix: &str) -> Self {
        let pattern = Regex::new(&format!(
            r"^{}(?P<cdn>cdn|nocdn):(?P<affinity>(no|ip|ipport)affinity):(?P<host>[a-z0-9.\-]+)(?P<path>/.*)$",
            regex::escape(prefix)
        ))
        .expect("tag pattern is a valid regex");
        Self { pattern }
    }

    pub fn parse(&self, tag: &str) -> Result<TagInfo> {
        let caps = self
            .pattern
            .captures(tag)
            .ok_or_else(|| DaemonError::MalformedTag(tag.to_string()))?;

        let affinity = match &caps["affinity"] {
            "noaffinity" => Affinity::None,
            "ipaffinity" => Affinity::ClientIp,
            "ipportaffinity" => Affinity::ClientIpPort,
            _ => return Err(DaemonError::MalformedTag(tag.to_string())),
        };

        Ok(TagInfo {
            raw: tag.to_string(),
            cdn: &caps["cdn"] == "cdn",
            affinity,
            host: caps["host"].to_string(),
            path: caps["path"].to_string(),
        })
    }
}

/// Derives a cloud resource name from a prefix and a group key, honoring the
/// 63-character cap. Truncation can expose a dash at the end of the name,
/// which the API rejects, so trailing dashes are stripped afterwards.
pub fn resource_name(prefix: &str, group: &str) -> String {
    let mut name = format!("{}-{}", prefix, group);
    if name.len() > MAX_RESOURCE_NAME_LEN {
        name.truncate(MAX_RESOURCE_NAME_LEN);
        while name.ends_with('-') {
            name.pop();
        }
    }
    name
}

#[cfg(test)]
mod tests;
