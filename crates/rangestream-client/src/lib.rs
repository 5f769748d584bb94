//! RangeStream client library: producer and consumer.
//!
//! Both clients resolve topology through the placement driver, talk to
//! range-server leaders directly, and retry leadership churn with bounded
//! jittered backoff.
//!
//! ```ignore
//! use rangestream_client::{Consumer, Producer};
//! use rangestream_pd::PdClient;
//! use std::sync::Arc;
//!
//! let pd = Arc::new(PdClient::new(vec!["127.0.0.1:7070".into()]));
//! let descriptor = pd.create_stream(3).await?;
//!
//! let producer = Producer::builder().pd(pd.clone()).build()?;
//! producer.send(descriptor.stream, None, Bytes::from("hello")).await?;
//!
//! let mut consumer = Consumer::builder()
//!     .pd(pd)
//!     .stream(descriptor.stream)
//!     .build()?;
//! let records = consumer.poll().await?;
//! ```

pub mod consumer;
pub mod error;
pub mod producer;
pub mod resolver;
pub mod retry;

pub use consumer::{Consumer, ConsumerBuilder};
pub use error::{ClientError, Result};
pub use producer::{Producer, ProducerBuilder};
pub use retry::RetryPolicy;
