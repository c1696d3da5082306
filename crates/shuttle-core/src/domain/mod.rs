//! Domain model (ids, descriptor, records, states, errors).
//!
//! I/O を持たない部分だけをここに置きます。

pub mod descriptor;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod payload;
pub mod records;
pub mod state;
pub mod validator;

pub use self::descriptor::{Descriptor, ParamSource, SyncCondition, SyncFunction, TaskSpec, WaitSpec};
pub use self::errors::{FieldFailure, Result, ShuttleError, ValidationErrors};
pub use self::ids::{JobId, LeaseToken, MessageId, TaskId, WorkerId, WorkflowId};
pub use self::outcome::Outcome;
pub use self::payload::Payload;
pub use self::records::{
    Delivery, JobRecord, Lease, NewTask, Page, SortOrder, TaskRecord, WorkflowRecord,
};
pub use self::state::{StatusCounts, TaskStatus};
pub use self::validator::DescriptorValidator;
