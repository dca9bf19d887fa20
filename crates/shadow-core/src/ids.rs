use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Uuid);

        // Serialized/deserialized through the prefixed `Display`/`FromStr`
        // form (`task_<uuid>`), not `#[serde(transparent)]` over the bare
        // `Uuid` — every wire boundary (JSON bodies, Axum path/query
        // extractors) must see and accept the same string a client gets
        // back from an earlier response.
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(D::Error::custom)
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let body = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Uuid::parse_str(body)
                    .map($name)
                    .map_err(|e| CoreError::InvalidId(e.to_string()))
            }
        }
    };
}

id_type!(TaskId, "task");
id_type!(VariantId, "variant");
id_type!(MessageId, "msg");
id_type!(ToolCallId, "tool");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_display_and_parse() {
        let id = TaskId::new();
        let rendered = id.to_string();
        assert!(rendered.starts_with("task_"));
        let parsed: TaskId = rendered.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_garbage() {
        let result = "not-a-uuid".parse::<MessageId>();
        assert!(result.is_err());
    }

    #[test]
    fn json_round_trips_through_the_prefixed_string_form() {
        let id = VariantId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: VariantId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn deserializes_a_bare_uuid_without_the_prefix_too() {
        let uuid = Uuid::new_v4();
        let json = format!("\"{uuid}\"");
        let parsed: ToolCallId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_uuid(), uuid);
    }
}
