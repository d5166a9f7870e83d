//! Validated relay URL newtype.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A relay websocket URL, validated at parse time so transports never hold an
/// unusable address.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(String);

#[derive(Clone, Debug, Error, PartialEq)]
pub enum InvalidRelayUrl {
    #[error("relay URL must use a ws:// or wss:// scheme: '{0}'")]
    BadScheme(String),
    #[error("relay URL has an empty host: '{0}'")]
    EmptyHost(String),
}

impl RelayUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RelayUrl {
    type Err = InvalidRelayUrl;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("wss://")
            .or_else(|| s.strip_prefix("ws://"))
            .ok_or_else(|| InvalidRelayUrl::BadScheme(s.to_owned()))?;
        let host = rest.split('/').next().unwrap_or("");
        if host.is_empty() {
            return Err(InvalidRelayUrl::EmptyHost(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = InvalidRelayUrl;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}

impl Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_ws_and_wss() {
        assert!("wss://relay.example.com".parse::<RelayUrl>().is_ok());
        assert!("ws://localhost:7000/sub".parse::<RelayUrl>().is_ok());
    }

    #[test]
    fn rejects_other_schemes_and_empty_hosts() {
        assert_eq!(
            "https://relay.example.com".parse::<RelayUrl>(),
            Err(InvalidRelayUrl::BadScheme(
                "https://relay.example.com".to_owned()
            ))
        );
        assert_eq!(
            "wss:///path".parse::<RelayUrl>(),
            Err(InvalidRelayUrl::EmptyHost("wss:///path".to_owned()))
        );
    }
}
