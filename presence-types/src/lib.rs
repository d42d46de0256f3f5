#![deny(missing_docs)]
//! Shared wire protocol and domain types for the ephemeral presence service.
//!
//! This crate groups together the strongly-typed values and message
//! structures used between the presence core and any client or administrative
//! surface. It provides:
//!
//! * Opaque, `Uuid`-backed identifiers for moments, sessions and sockets (see
//!   the root module).
//! * Domain value types describing moments, sessions and presences (see
//!   [`domain`]).
//! * The WebSocket wire protocol exchanged over the Connection Gateway (see
//!   [`frame`]).
//! * The closed set of error codes the service ever reports to a client (see
//!   [`error`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod domain;
pub mod error;
pub mod frame;

pub use error::ErrorCode;

/// Declares a `Uuid`-backed opaque identifier with the usual trait impls.
macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing `Uuid`.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying `Uuid`.
            pub fn into_inner(self) -> Uuid {
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
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(MomentId, "Opaque identifier of a [`domain::Moment`].");
uuid_id!(SessionId, "Opaque identifier of a [`domain::Session`].");
uuid_id!(PresenceId, "Opaque identifier of a [`domain::Presence`].");

/// The stable identifier of a single long-lived duplex channel.
///
/// Unlike the other ids this is not a `Uuid`: the Connection Gateway mints it
/// as 128 bits of randomness encoded as 32 hex characters with a short tag
/// prefix, matching the wire format clients observe in `joined`/`left` frames.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(String);

impl SocketId {
    /// Mints a new random socket id with the given short tag prefix (e.g. `"sk"`).
    pub fn generate(tag: &str) -> Self {
        let mut bytes = [0u8; 16];
        rand_bytes(&mut bytes);
        let mut hex = String::with_capacity(tag.len() + 1 + bytes.len() * 2);
        hex.push_str(tag);
        hex.push('_');
        for b in bytes {
            hex.push_str(&format!("{b:02x}"));
        }
        Self(hex)
    }

    /// Returns the socket id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketId({})", self.0)
    }
}

impl From<String> for SocketId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Fills `buf` with cryptographically secure random bytes.
///
/// Kept as a tiny indirection so callers outside of a `rand`-aware context
/// (e.g. test fixtures) don't need to pull in the crate themselves.
fn rand_bytes(buf: &mut [u8]) {
    use rand::RngCore as _;
    rand::rngs::OsRng.fill_bytes(buf);
}
