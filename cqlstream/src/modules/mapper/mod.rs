//! Record <-> Statement/Row mapping, driven by the `schema.mapping` configuration string.
//!
//! Unlike connectors and drivers, the mapper is not a user-pluggable backend; it is a fixed
//! internal component parameterized by configuration rather than a registered plugin.
pub mod simple;

pub use simple::SimpleMapper;
