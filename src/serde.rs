use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::Deserializer;
use void::Void;

/// A Visitor implementation that is able to parse either a bare string or a
/// bare non-negative integer. Numbers are fed through `FromStr` in their
/// decimal form, so the target type sees one canonical representation.
/// https://serde.rs/string-or-struct.html
pub fn string_or_count<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    struct StringOrCount<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for StringOrCount<T>
    where
        T: FromStr<Err = Void>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("string or non-negative integer")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(FromStr::from_str(value).unwrap())
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(FromStr::from_str(&value.to_string()).unwrap())
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(FromStr::from_str(&value.to_string()).unwrap())
        }
    }

    deserializer.deserialize_any(StringOrCount(PhantomData))
}

/// Same as [`string_or_count`], for optional fields. Absent fields stay
/// `None` through `#[serde(default)]`; present fields always parse.
pub fn string_or_count_opt<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    string_or_count(deserializer).map(Some)
}
