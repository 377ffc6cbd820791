//! Lenient boolean deserialisation for feature-flag environment variables.
//!
//! Cron providers and container platforms disagree on how to spell a boolean;
//! `1`/`0`, `yes`/`no`, and any casing of `true`/`false` are all accepted.

use serde::de::{self, Deserializer};

pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlagVisitor;

    impl de::Visitor<'_> for FlagVisitor {
        type Value = bool;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a boolean flag (true/false, 1/0, yes/no)")
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<bool, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<bool, E> {
            match v {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(E::invalid_value(de::Unexpected::Unsigned(v), &self)),
            }
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<bool, E> {
            match v {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(E::invalid_value(de::Unexpected::Signed(v), &self)),
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<bool, E> {
            if v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes") || v == "1" {
                Ok(true)
            } else if v.eq_ignore_ascii_case("false") || v.eq_ignore_ascii_case("no") || v == "0" {
                Ok(false)
            } else {
                Err(E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }
    }

    deserializer.deserialize_any(FlagVisitor)
}
