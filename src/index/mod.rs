//! Identifier indexes: CA and PA (unique id → definition) and the
//! multi-valued short-id indexes (catalog id → definitions).

pub mod ca;
pub mod pa;
pub mod short_id;
