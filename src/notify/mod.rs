//! Webhook notification dispatch.
//!
//! Targets are configured as `LEVELS=url` (e.g.
//! `ERROR,WARNING=https://hooks.example.com/x`). A target with no level tags
//! defaults to ERROR so that routine logging is never spammed to it.

use crate::error::Error;
use anyhow::Result;
use log::{debug, warn};
use serde_json::json;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Notification levels, mirroring the logging levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Error,
    Warning,
    Info,
    Debug,
    ExtraDebug,
    WebsocketData,
}

impl Level {
    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "ERROR" => Some(Level::Error),
            "WARNING" => Some(Level::Warning),
            "INFO" => Some(Level::Info),
            "DEBUG" => Some(Level::Debug),
            "EXTRA_DEBUG" => Some(Level::ExtraDebug),
            "WEBSOCKET_DATA" => Some(Level::WebsocketData),
            _ => None,
        }
    }

    /// Payload type tag understood by apprise-compatible webhook receivers.
    fn notify_type(self) -> &'static str {
        match self {
            Level::Error => "failure",
            Level::Warning => "warning",
            _ => "info",
        }
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Error => write!(f, "ERROR"),
            Level::Warning => write!(f, "WARNING"),
            Level::Info => write!(f, "INFO"),
            Level::Debug => write!(f, "DEBUG"),
            Level::ExtraDebug => write!(f, "EXTRA_DEBUG"),
            Level::WebsocketData => write!(f, "WEBSOCKET_DATA"),
        }
    }
}

/// One configured notification target.
#[derive(Debug, Clone)]
pub struct NotifierSpec {
    pub levels: HashSet<Level>,
    pub url: String,
}

impl NotifierSpec {
    /// Parse a `LEVELS=url` spec. The prefix before the first `=` is only
    /// treated as a level list when every token is a known level name, so
    /// URLs containing `=` still parse.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Config("empty notifier spec".to_string()).into());
        }

        if let Some((prefix, url)) = raw.split_once('=') {
            let levels: Option<HashSet<Level>> =
                prefix.split(',').map(Level::parse).collect();
            if let Some(levels) = levels {
                if url.trim().is_empty() {
                    return Err(
                        Error::Config(format!("notifier spec `{raw}` has no url")).into()
                    );
                }
                return Ok(NotifierSpec {
                    levels,
                    url: url.trim().to_string(),
                });
            }
        }

        Ok(NotifierSpec {
            levels: [Level::Error].into_iter().collect(),
            url: raw.to_string(),
        })
    }
}

/// Dispatches notifications to all configured targets. Failures are logged
/// and never propagate.
pub struct Notifier {
    specs: Vec<NotifierSpec>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(specs: Vec<NotifierSpec>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Notifier { specs, client }
    }

    pub fn has_targets(&self) -> bool {
        !self.specs.is_empty()
    }

    pub async fn dispatch(&self, level: Level, title: &str, body: &str) {
        for spec in self.specs.iter().filter(|s| s.levels.contains(&level)) {
            let payload = json!({
                "title": title,
                "body": body,
                "type": level.notify_type(),
                "tag": level.to_string(),
            });

            match self.client.post(&spec.url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Dispatched {level} notification to {}", spec.url);
                }
                Ok(response) => {
                    warn!(
                        "Notification target {} returned {}",
                        spec.url,
                        response.status()
                    );
                }
                Err(e) => {
                    warn!("Failed to notify {}: {e}", spec.url);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_prefix() {
        let spec = NotifierSpec::parse("ERROR,WARNING=https://hooks.example.com/x").unwrap();
        assert!(spec.levels.contains(&Level::Error));
        assert!(spec.levels.contains(&Level::Warning));
        assert_eq!(spec.url, "https://hooks.example.com/x");
    }

    #[test]
    fn bare_url_defaults_to_error() {
        let spec = NotifierSpec::parse("https://hooks.example.com/x").unwrap();
        assert_eq!(spec.levels.len(), 1);
        assert!(spec.levels.contains(&Level::Error));
    }

    #[test]
    fn url_with_query_equals_is_not_a_level_list() {
        let spec = NotifierSpec::parse("https://hooks.example.com/x?token=abc").unwrap();
        assert!(spec.levels.contains(&Level::Error));
        assert_eq!(spec.url, "https://hooks.example.com/x?token=abc");
    }

    #[test]
    fn rejects_empty_spec() {
        assert!(NotifierSpec::parse("").is_err());
        assert!(NotifierSpec::parse("ERROR=").is_err());
    }
}
