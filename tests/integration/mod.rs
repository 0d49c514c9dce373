//! Integration tests for duckconn.

pub mod in_process_test;
pub mod load_test;
pub mod remote_test;
