//! Script migrations.
//!
//! A `.js` migration wraps its SQL in triple-quoted blocks, e.g.
//! `db.execute('''ALTER TABLE ...''');`, which is also what `sql-generate`
//! writes. Each block is executed in order; text outside the blocks is
//! ignored.

use stashdb_core::{StashResult, StorageError};

const DELIMITER: &str = "'''";

/// The SQL blocks of a script, in order.
pub fn extract_sql(source: &str, file_name: &str) -> StashResult<Vec<String>> {
    let mut blocks = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find(DELIMITER) {
        let after = &rest[start + DELIMITER.len()..];
        let Some(end) = after.find(DELIMITER) else {
            return Err(StorageError::Migration {
                file: file_name.to_string(),
                reason: "unterminated ''' block".to_string(),
            }
            .into());
        };
        let block = after[..end].trim();
        if !block.is_empty() {
            blocks.push(block.to_string());
        }
        rest = &after[end + DELIMITER.len()..];
    }
    if blocks.is_empty() {
        return Err(StorageError::Migration {
            file: file_name.to_string(),
            reason: "script contains no ''' SQL blocks".to_string(),
        }
        .into());
    }
    Ok(blocks)
}
