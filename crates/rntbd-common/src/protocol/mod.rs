pub mod error;
pub mod frame;
pub mod metadata;
pub mod requests;
pub mod responses;
pub mod session;
pub mod types;


pub use error::{Diagnostics, Result, RntbdError};
pub use frame::{Frame, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
pub use metadata::Metadata;
pub use requests::StoreRequest;
pub use responses::StoreResponse;
pub use session::{PartitionId, SessionToken};
pub use types::{
    status_codes, sub_status_codes, ConsistencyLevel, OperationType, ResourceType,
    REQUEST_CHARGE_HEADER,
};
