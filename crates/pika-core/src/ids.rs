//! Opaque identifiers for sessions and requests.
//!
//! Server-minted ids are `<tag>_<uuid v7>` so they sort by creation time.
//! Ids arriving from clients are kept exactly as sent.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident => $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const TAG: &'static str = $tag;

            pub fn new() -> Self {
                Self(format!(concat!($tag, "_{}"), Uuid::now_v7()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

prefixed_id!(
    /// One connected client, minted on upgrade.
    SessionId => "sess"
);
prefixed_id!(
    /// Correlates a command with its responses. Minted when the client
    /// leaves it out.
    RequestId => "req"
);
