// Typed errors for the detailed read channel

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::codec::CodecError;

/// Why a detailed read produced no value.
///
/// The default read path folds all of these into "absent"; only
/// `ObjectStore::read_result` surfaces them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Read was dropped before it ran")]
    Cancelled,
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Io {
            path: PathBuf::from("/data/prefs.obj"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "I/O error on /data/prefs.obj: denied");

        let err: StoreError = CodecError::Decode("bad json".to_string()).into();
        assert_eq!(err.to_string(), "Failed to decode value: bad json");
    }
}
