use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

opaque_id!(
    /// Opaque identifier assigned to a websocket by the gateway.
    ConnectionId
);

opaque_id!(
    /// Identity of one running instance, unique within an application's
    /// membership set.
    InstanceId
);

impl InstanceId {
    /// Fresh random candidate. Uniqueness is only established once the ID has
    /// been added to the membership set.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_instance_ids_are_uuids() {
        let id = InstanceId::generate();
        assert!(Uuid::parse_str(id.as_str()).is_ok(), "got: {id}");
    }

    #[test]
    fn generated_instance_ids_are_unique() {
        let a = InstanceId::generate();
        let b = InstanceId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn connection_id_is_opaque() {
        let id = ConnectionId::from_raw("ws-42:abc");
        assert_eq!(id.as_str(), "ws-42:abc");
        assert_eq!(id.to_string(), "ws-42:abc");
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = InstanceId::generate();
        let parsed: InstanceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ConnectionId::from("c1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""c1""#);
        let parsed: ConnectionId = serde_json::from_str(r#""c1""#).unwrap();
        assert_eq!(parsed, id);
    }
}
