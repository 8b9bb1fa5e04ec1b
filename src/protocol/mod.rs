//! Kafka wire protocol: record containers and the fetch API.
//!
//! Brokers return records in one of two container formats, told apart by
//! the magic byte both formats keep at the same position:
//!
//! | Magic | Container | Decoder |
//! |-------|-----------|---------|
//! | 0, 1  | legacy message set | [`legacy`] |
//! | 2     | record batch | [`record`] |
//!
//! [`fetch`] handles the request/response framing around the containers,
//! and [`versions`] maps the configured broker release to the fetch
//! version actually spoken.

pub mod fetch;
pub mod legacy;
pub mod record;
pub mod versions;
