//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type パターンで型付けしています。
//! `WorkflowId` と `TaskId` は同じ 128-bit の ULID ですが、コンパイル時に
//! 混同できません。
//!
//! Lease のトークンも同じ仕組みで表現します。トークンは「誰がロックを
//! 持っているか」を証明するだけの不透明な値です。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"job-", "task-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

macro_rules! id_marker {
    ($(#[$doc:meta])* $marker:ident => $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $marker {}

        impl IdMarker for $marker {
            fn prefix() -> &'static str {
                $prefix
            }
        }
    };
}

id_marker!(
    /// Workflow のマーカー型
    Workflow => "wf-"
);
id_marker!(
    /// Job のマーカー型
    Job => "job-"
);
id_marker!(
    /// Task のマーカー型
    Task => "task-"
);
id_marker!(
    /// キュー配送（メッセージ）のマーカー型
    Message => "msg-"
);
id_marker!(
    /// Lease トークンのマーカー型
    Lease => "lease-"
);
id_marker!(
    /// Worker インスタンスのマーカー型
    Worker => "worker-"
);

/// Identifier of a persisted workflow definition.
pub type WorkflowId = Id<Workflow>;

/// Identifier of a job (one instantiation of a workflow).
pub type JobId = Id<Job>;

/// Identifier of a task (one unit of work within a job).
pub type TaskId = Id<Task>;

/// Identifier of one queue delivery.
pub type MessageId = Id<Message>;

/// Opaque proof of lease ownership.
pub type LeaseToken = Id<Lease>;

/// Identifier of a running worker loop (logging only).
pub type WorkerId = Id<Worker>;
