//! Operator commands behind the CLI.
//!
//! Each returns a serializable response or an [`AppError`]; printing is left
//! to the binary.

mod entries;
mod status;

pub use entries::*;
pub use status::*;

use crate::database::{Database, Entry};
use crate::error::AppError;

/// Look an entry up by id, falling back to its URL.
pub fn find_entry(db: &Database, key: &str) -> Result<Entry, AppError> {
    if let Some(entry) = db.get_entry(key)? {
        return Ok(entry);
    }
    db.get_entry_by_url(key.trim())?
        .ok_or_else(|| AppError::NotFound(format!("entry {}", key)))
}
