//! Data model
//!
//! Typed records that flow through every tier operation:
//!
//! - [`KvPair`] / [`KvPairs`] - keys and their field maps
//! - [`KeyInfo`] / [`AnyKey`] - per-key routing metadata
//! - [`QueryInfo`] / [`Condition`] - declarative filters
//! - [`Context`] - per-operation execution state
//! - [`KeySpace`] - key names in the distributed store

mod context;
mod key_info;
mod keyspace;
mod kv;
mod query;

pub use context::{Context, ExecMode, Stage, StageTimer};
pub use key_info::{AnyKey, KeyInfo, Routing};
pub use keyspace::KeySpace;
pub use kv::{
    decode_fields, encode_fields, FieldMap, KvPair, KvPairs, DATA_TYPE, DEFAULT_FIELD, INFO_TYPE,
    TRACE_TYPE, WILDCARD_ID,
};
pub use query::{Condition, Filter, Operator, QueryInfo};
