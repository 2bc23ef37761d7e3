/// Handshake documents exchanged when a connection is opened
use crate::core::ServerRole;
use serde::{Deserialize, Serialize};

/// Oldest wire version this client can speak
pub const MIN_WIRE_VERSION: i32 = 6;
/// Newest wire version this client can speak
pub const MAX_WIRE_VERSION: i32 = 21;

pub const DRIVER_NAME: &str = "docwire";

/// Hello request sent as the payload of a `Handshake` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloCommand {
    pub hello: i32,
    pub client: ClientMetadata,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientMetadata {
    pub application: String,
    pub driver: String,
    pub version: String,
}

impl HelloCommand {
    pub fn new(app_name: &str) -> Self {
        Self {
            hello: 1,
            client: ClientMetadata {
                application: app_name.to_string(),
                driver: DRIVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            min_wire_version: MIN_WIRE_VERSION,
            max_wire_version: MAX_WIRE_VERSION,
        }
    }
}

/// Server answer to a hello request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    pub ok: f64,
    #[serde(default)]
    pub is_writable_primary: bool,
    #[serde(default)]
    pub secondary: bool,
    #[serde(default)]
    pub set_name: Option<String>,
    #[serde(default)]
    pub min_wire_version: i32,
    #[serde(default)]
    pub max_wire_version: i32,
    #[serde(default)]
    pub max_message_size_bytes: Option<usize>,
    #[serde(default)]
    pub errmsg: Option<String>,
}

impl HelloReply {
    /// Role advertised by the server
    ///
    /// Without a replica set name the server is a standalone; inside a set,
    /// members that are neither primary nor secondary have no usable role.
    pub fn role(&self) -> ServerRole {
        match (&self.set_name, self.is_writable_primary, self.secondary) {
            (None, true, _) => ServerRole::Standalone,
            (Some(_), true, _) => ServerRole::Primary,
            (Some(_), false, true) => ServerRole::Secondary,
            _ => ServerRole::Unknown,
        }
    }

    /// Check that the server's wire version range overlaps ours
    pub fn check_compatibility(&self) -> Result<(), String> {
        if self.min_wire_version > MAX_WIRE_VERSION {
            return Err(format!(
                "server requires wire version {} but this client supports at most {}",
                self.min_wire_version, MAX_WIRE_VERSION
            ));
        }
        if self.max_wire_version < MIN_WIRE_VERSION {
            return Err(format!(
                "server supports wire version {} but this client requires at least {}",
                self.max_wire_version, MIN_WIRE_VERSION
            ));
        }
        Ok(())
    }
}
