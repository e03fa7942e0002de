use marcus_core::error::MarcusError;

/// Map a sqlx error onto the coordination error space.
///
/// Corruption is fatal; everything else storage-related is retryable.
pub fn sqlx_error_to_marcus_error(err: sqlx::Error) -> MarcusError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("malformed")
                || message.contains("not a database")
                || message.contains("disk image")
            {
                MarcusError::storage_corrupt(format!("Database corruption detected: {message}"))
            } else {
                MarcusError::storage_unavailable(format!("Database error: {message}"))
            }
        }
        sqlx::Error::PoolTimedOut => {
            MarcusError::storage_unavailable("Connection pool timeout".to_string())
        }
        sqlx::Error::Io(io_err) => {
            MarcusError::storage_unavailable(format!("Database I/O error: {io_err}"))
        }
        sqlx::Error::Decode(decode_err) => {
            MarcusError::storage_corrupt(format!("Failed to decode stored row: {decode_err}"))
        }
        _ => MarcusError::storage_unavailable(format!("Database operation failed: {err}")),
    }
}
