//! Value names and computed payloads.

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from anything string-like
            #[must_use]
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Get as string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifies one value computed by (or supplied to) a graph
    ValueId
);

string_id!(
    /// Names an externally requested result
    ValueRequirement
);

string_id!(
    /// Opaque handle naming the function a node invokes
    FunctionId
);

/// A value together with its computed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    /// Which value this is
    pub value: ValueId,
    /// Payload produced by the function
    pub payload: serde_json::Value,
}

impl ComputedValue {
    /// Create a new computed value
    #[must_use]
    pub fn new(value: impl Into<ValueId>, payload: serde_json::Value) -> Self {
        Self {
            value: value.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_id_display() {
        let id = ValueId::new("N2.a");
        assert_eq!(id.to_string(), "N2.a");
        assert_eq!(id.as_str(), "N2.a");
        assert_eq!(id, ValueId::from("N2.a"));
    }

    #[test]
    fn test_value_ids_order_lexically() {
        assert!(ValueId::from("a") < ValueId::from("b"));
    }

    #[test]
    fn test_computed_value_json() {
        let v = ComputedValue::new("pv", serde_json::json!(1.5));
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["value"], "pv");
        assert_eq!(json["payload"], 1.5);
    }
}
