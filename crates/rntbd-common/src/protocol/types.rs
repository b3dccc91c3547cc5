//! Enumerations carried in frame headers and metadata.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{Result, RntbdError};

/// Status codes a replica reports in the `status_code` metadata token.
pub mod status_codes {
    pub const OK: u32 = 200;
    pub const CREATED: u32 = 201;
    pub const NO_CONTENT: u32 = 204;
    pub const NOT_MODIFIED: u32 = 304;
    pub const BAD_REQUEST: u32 = 400;
    pub const NOT_FOUND: u32 = 404;
    pub const REQUEST_TIMEOUT: u32 = 408;
    pub const CONFLICT: u32 = 409;
    pub const GONE: u32 = 410;
    pub const PRECONDITION_FAILED: u32 = 412;
    pub const TOO_MANY_REQUESTS: u32 = 429;
    pub const INTERNAL_SERVER_ERROR: u32 = 500;
    pub const SERVICE_UNAVAILABLE: u32 = 503;
}

/// Sub-status codes refining a status code.
pub mod sub_status_codes {
    pub const UNKNOWN: u32 = 0;
    /// 410: the replica no longer serves this collection name.
    pub const NAME_CACHE_IS_STALE: u32 = 1000;
    /// 410: the partition key range was split or merged away.
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    /// 404: no replica reached the requested session token.
    pub const READ_SESSION_NOT_AVAILABLE: u32 = 1002;
    pub const COMPLETING_SPLIT: u32 = 1007;
    pub const COMPLETING_PARTITION_MIGRATION: u32 = 1008;
}

/// Response header carrying the request charge.
pub const REQUEST_CHARGE_HEADER: &str = "x-ms-request-charge";

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident : $repr:ty { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn to_wire(self) -> $repr {
                match self {
                    $($name::$variant => $value),+
                }
            }

            pub fn from_wire(value: $repr) -> Result<Self> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(RntbdError::MalformedFrame(format!(
                        "unknown {} {:#x}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

wire_enum! {
    ResourceType: u16 {
        Connection = 0x0000,
        Database = 0x0001,
        Collection = 0x0002,
        Document = 0x0003,
        Attachment = 0x0004,
        User = 0x0005,
        Permission = 0x0006,
        StoredProcedure = 0x0007,
        PartitionKeyRange = 0x0008,
    }
}

wire_enum! {
    OperationType: u16 {
        Create = 0x0001,
        Patch = 0x0002,
        Read = 0x0003,
        ReadFeed = 0x0004,
        Delete = 0x0005,
        Replace = 0x0006,
        Upsert = 0x0007,
        Query = 0x0008,
        Head = 0x0009,
        HeadFeed = 0x000A,
    }
}

impl OperationType {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            OperationType::Create
                | OperationType::Patch
                | OperationType::Delete
                | OperationType::Replace
                | OperationType::Upsert
        )
    }

    pub fn is_read(self) -> bool {
        !self.is_write()
    }
}

/// Consistency level a logical request is served under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    Session,
    Eventual,
    ConsistentPrefix,
}

impl ConsistencyLevel {
    pub fn to_wire(self) -> u8 {
        match self {
            ConsistencyLevel::Strong => 0x00,
            ConsistencyLevel::BoundedStaleness => 0x01,
            ConsistencyLevel::Session => 0x02,
            ConsistencyLevel::Eventual => 0x03,
            ConsistencyLevel::ConsistentPrefix => 0x04,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(ConsistencyLevel::Strong),
            0x01 => Ok(ConsistencyLevel::BoundedStaleness),
            0x02 => Ok(ConsistencyLevel::Session),
            0x03 => Ok(ConsistencyLevel::Eventual),
            0x04 => Ok(ConsistencyLevel::ConsistentPrefix),
            other => Err(RntbdError::MalformedFrame(format!(
                "unknown ConsistencyLevel {:#x}",
                other
            ))),
        }
    }

    /// Reads at this level must observe a read quorum of replicas.
    pub fn requires_quorum_read(self) -> bool {
        matches!(
            self,
            ConsistencyLevel::Strong | ConsistencyLevel::BoundedStaleness
        )
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsistencyLevel::Strong => "strong",
            ConsistencyLevel::BoundedStaleness => "bounded_staleness",
            ConsistencyLevel::Session => "session",
            ConsistencyLevel::Eventual => "eventual",
            ConsistencyLevel::ConsistentPrefix => "consistent_prefix",
        };
        f.write_str(name)
    }
}

impl FromStr for ConsistencyLevel {
    type Err = RntbdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "strong" => Ok(ConsistencyLevel::Strong),
            "bounded_staleness" | "boundedstaleness" => Ok(ConsistencyLevel::BoundedStaleness),
            "session" => Ok(ConsistencyLevel::Session),
            "eventual" => Ok(ConsistencyLevel::Eventual),
            "consistent_prefix" | "consistentprefix" => Ok(ConsistencyLevel::ConsistentPrefix),
            other => Err(RntbdError::Config(format!(
                "unknown consistency level '{}'",
                other
            ))),
        }
    }
}
