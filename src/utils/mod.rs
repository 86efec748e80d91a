//! Utility modules for Vigil
//!
//! Provides helpers for path handling, pid parsing and process-detail queries.

pub mod path;
pub mod process;
pub mod time;
pub mod user;

pub use path::{has_path_separator, image_basename, normalize_path};
pub use process::{parse_pid, query_process_details, ProcessInfo};
pub use time::now_timestamp_string;
