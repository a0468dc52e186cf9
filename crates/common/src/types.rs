use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true if the identifier is empty or only whitespace.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identity of an autonomously running node that owns resources.
    NodeId
);

string_id!(
    /// Identity of a client; used to derive the client's response topic.
    ClientId
);

string_id!(
    /// Identity of a reservable resource (a charging or fuel station).
    ResourceId
);

string_id!(
    /// Correlation key of a reservation request.
    ///
    /// Generated by the caller and unique across the whole system; the same
    /// value travels on the request, the peer calls and the response.
    RequestId
);

impl RequestId {
    /// Generates a fresh random request ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Address of a single reservation leg: which node owns which resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub node_id: NodeId,
    pub resource_id: ResourceId,
}

impl ResourceRef {
    pub fn new(node_id: impl Into<NodeId>, resource_id: impl Into<ResourceId>) -> Self {
        Self {
            node_id: node_id.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Node-qualified key, `node_id/resource_id`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node_id, self.resource_id)
    }
}
