//! Core data model for RangeStream.
//!
//! This crate defines the types shared by every other RangeStream crate:
//!
//! - [`Record`] / [`NewRecord`]: the unit of data in a stream
//! - [`RangeId`], [`RangeMetadata`], [`StreamDescriptor`]: the placement model
//! - [`Watermarks`]: the fetchable window of a range
//! - [`Error`]: the cluster-wide error taxonomy
//!
//! A **stream** is a named, unbounded, ordered sequence of records,
//! partitioned into one or more **ranges**. A range covers a contiguous
//! offset interval `[start_offset, end_offset)` of its stream; ranges never
//! overlap and their union is offset-contiguous from 0. Each range is owned
//! by exactly one replica set at a time, with a single leader fenced by a
//! monotonically increasing epoch issued by the placement driver.

pub mod error;
pub mod record;
pub mod types;

pub use error::{Error, Result};
pub use record::{NewRecord, Record};
pub use types::{
    Epoch, LeaderInfo, Lease, NodeDescriptor, NodeId, RangeId, RangeMetadata, ReplicaProgress,
    StreamDescriptor, StreamId, Watermarks,
};
