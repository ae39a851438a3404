// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chart identity.
//!
//! A [`ChartReference`] names one running chart: the machine id selects the
//! definition, the chart id one running instance of it. References are plain
//! values and serialize to the `xjog+chart:` URI form:
//!
//! ```text
//! xjog+chart:[//host]/<percent-encoded machineId>/<percent-encoded chartId>
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// URI scheme for chart references.
pub const CHART_URI_SCHEME: &str = "xjog+chart";

/// Globally unique identity of one running chart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChartReference {
    /// Identifier of the machine definition.
    #[serde(rename = "machineId")]
    pub machine_id: String,
    /// Identifier of the running instance.
    #[serde(rename = "chartId")]
    pub chart_id: String,
}

impl ChartReference {
    /// Create a reference from a machine id and a chart id.
    pub fn new(machine_id: impl Into<String>, chart_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            chart_id: chart_id.into(),
        }
    }

    /// Render the `xjog+chart:` URI form of this reference.
    pub fn uri(&self) -> String {
        format!(
            "{}:/{}/{}",
            CHART_URI_SCHEME,
            urlencoding::encode(&self.machine_id),
            urlencoding::encode(&self.chart_id)
        )
    }

    /// Parse a reference from its URI form.
    ///
    /// An authority part (`//host`) is accepted and ignored; the path must
    /// hold exactly two non-empty percent-encoded segments.
    pub fn parse_uri(input: &str) -> Result<Self, UriError> {
        let rest = input
            .strip_prefix(CHART_URI_SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| UriError::Scheme(input.to_string()))?;

        // Skip an optional //host authority.
        let path = if let Some(after) = rest.strip_prefix("//") {
            match after.find('/') {
                Some(idx) => &after[idx..],
                None => return Err(UriError::Path(input.to_string())),
            }
        } else {
            rest
        };

        let mut segments = path
            .strip_prefix('/')
            .ok_or_else(|| UriError::Path(input.to_string()))?
            .split('/');

        let machine_id = segments.next().filter(|s| !s.is_empty());
        let chart_id = segments.next().filter(|s| !s.is_empty());
        if segments.next().is_some() {
            return Err(UriError::Path(input.to_string()));
        }

        match (machine_id, chart_id) {
            (Some(m), Some(c)) => Ok(Self {
                machine_id: urlencoding::decode(m)
                    .map_err(|_| UriError::Encoding(input.to_string()))?
                    .into_owned(),
                chart_id: urlencoding::decode(c)
                    .map_err(|_| UriError::Encoding(input.to_string()))?
                    .into_owned(),
            }),
            _ => Err(UriError::Path(input.to_string())),
        }
    }
}

impl fmt::Display for ChartReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

impl FromStr for ChartReference {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_uri(s)
    }
}

/// Failure to parse a chart URI.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UriError {
    /// The input does not start with the `xjog+chart:` scheme.
    #[error("not an {CHART_URI_SCHEME} URI: '{0}'")]
    Scheme(String),

    /// The path does not hold exactly a machine id and a chart id.
    #[error("malformed chart URI path: '{0}'")]
    Path(String),

    /// A path segment is not valid percent-encoded UTF-8.
    #[error("invalid percent-encoding in chart URI: '{0}'")]
    Encoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_round_trip() {
        let reference = ChartReference::new("order", "7f3a");
        let uri = reference.uri();
        assert_eq!(uri, "xjog+chart:/order/7f3a");
        assert_eq!(ChartReference::parse_uri(&uri).unwrap(), reference);
    }

    #[test]
    fn uri_percent_encodes_segments() {
        let reference = ChartReference::new("orders/eu", "chart 1");
        let uri = reference.uri();
        assert_eq!(uri, "xjog+chart:/orders%2Feu/chart%201");
        assert_eq!(ChartReference::parse_uri(&uri).unwrap(), reference);
    }

    #[test]
    fn uri_accepts_and_ignores_host() {
        let parsed = ChartReference::parse_uri("xjog+chart://db-0/order/7f3a").unwrap();
        assert_eq!(parsed, ChartReference::new("order", "7f3a"));
    }

    #[test]
    fn uri_rejects_wrong_scheme() {
        assert!(matches!(
            ChartReference::parse_uri("http://x/y/z"),
            Err(UriError::Scheme(_))
        ));
    }

    #[test]
    fn uri_rejects_short_and_long_paths() {
        assert!(ChartReference::parse_uri("xjog+chart:/only-machine").is_err());
        assert!(ChartReference::parse_uri("xjog+chart:/a/b/c").is_err());
        assert!(ChartReference::parse_uri("xjog+chart:/a//").is_err());
    }

    #[test]
    fn from_str_and_display_agree() {
        let reference: ChartReference = "xjog+chart:/door/main".parse().unwrap();
        assert_eq!(reference.to_string(), "xjog+chart:/door/main");
    }
}
