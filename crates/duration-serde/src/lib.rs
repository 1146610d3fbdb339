//! Serde helpers for `std::time::Duration` configuration values.
//!
//! A duration may be written either as a number, which is taken to be
//! a count of seconds (fractions allowed), or as a human readable string
//! such as `"30s"` or `"5m 10s"` parsed by `humantime`.
//!
//! Use it on a field with `#[serde(with = "duration_serde")]`, or
//! `#[serde(with = "duration_serde::option")]` for `Option<Duration>`.
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum Repr {
    Seconds(u64),
    Fractional(f64),
    Text(String),
}

impl Repr {
    fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
        match self {
            Self::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Self::Fractional(secs) => Duration::try_from_secs_f64(secs).map_err(|err| {
                E::custom(format!(
                    "duration must be a non-negative number of seconds: {err:#}"
                ))
            }),
            Self::Text(text) => humantime::parse_duration(&text)
                .map_err(|err| E::custom(format!("invalid duration {text:?}: {err:#}"))),
        }
    }
}

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Repr::deserialize(deserializer)
        .map_err(|_| D::Error::custom("expected a number of seconds or a duration string"))?
        .into_duration()
}

pub mod option {
    use super::Repr;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => super::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<Repr>::deserialize(deserializer)?
            .map(Repr::into_duration)
            .transpose()
    }
}
