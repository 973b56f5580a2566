// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use secrecy::Secret;
use serde::Serializer;

/// Serialize a `Secret<String>` as `"[REDACTED]"`.
pub fn serialize_redacted<S>(_secret: &Secret<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str("[REDACTED]")
}

/// (De)serialize a `Duration` as integer milliseconds.
pub mod serde_duration_as_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Like [`serde_duration_as_millis`] but for `Option<Duration>`.
pub mod serde_opt_duration_as_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|duration| u64::try_from(duration.as_millis()))
            .transpose()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        #[serde(with = "super::serde_duration_as_millis")]
        timeout: Duration,
        #[serde(with = "super::serde_opt_duration_as_millis")]
        statement_timeout: Option<Duration>,
    }

    #[test]
    fn test_duration_round_trip() {
        let probe = Probe {
            timeout: Duration::from_millis(1500),
            statement_timeout: Some(Duration::from_secs(2)),
        };
        let json = serde_json::to_string(&probe).unwrap();
        assert_eq!(json, r#"{"timeout":1500,"statement_timeout":2000}"#);
        assert_eq!(serde_json::from_str::<Probe>(&json).unwrap(), probe);
    }

    #[test]
    fn test_missing_opt_duration() {
        let probe: Probe = serde_json::from_str(r#"{"timeout":10,"statement_timeout":null}"#).unwrap();
        assert_eq!(probe.statement_timeout, None);
    }
}
