//! Persisted record of the last fatal error.
//!
//! A host that crashes while running an update records the message here.
//! The next manifest request sends it to the server, after which it is
//! cleared.

use crate::error::LoaderResult;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use updraft_core::MAX_FATAL_ERROR_LEN;

const FATAL_ERROR_FILE: &str = "fatal-error.log";

#[derive(Clone, Debug)]
pub struct FatalErrorLog {
    path: PathBuf,
}

impl FatalErrorLog {
    /// A log stored inside the updates directory.
    pub fn new(updates_directory: impl AsRef<Path>) -> Self {
        Self {
            path: updates_directory.as_ref().join(FATAL_ERROR_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an error message, replacing any earlier one.
    pub async fn record(&self, message: &str) -> LoaderResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let truncated: String = message.chars().take(MAX_FATAL_ERROR_LEN).collect();
        tokio::fs::write(&self.path, truncated).await?;
        tracing::warn!(path = %self.path.display(), "Recorded fatal error");
        Ok(())
    }

    /// The recorded error, if any, without clearing it.
    pub async fn peek(&self) -> LoaderResult<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(message) if message.is_empty() => Ok(None),
            Ok(message) => Ok(Some(message)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove and return the recorded error.
    pub async fn take(&self) -> LoaderResult<Option<String>> {
        let message = self.peek().await?;
        if message.is_some() {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_record_then_take() {
        let temp = tempdir().unwrap();
        let log = FatalErrorLog::new(temp.path().join("updates"));

        assert_eq!(log.peek().await.unwrap(), None);
        log.record("first").await.unwrap();
        log.record("second").await.unwrap();

        assert_eq!(log.peek().await.unwrap().as_deref(), Some("second"));
        assert_eq!(log.take().await.unwrap().as_deref(), Some("second"));
        assert_eq!(log.take().await.unwrap(), None);
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_record_truncates_long_messages() {
        let temp = tempdir().unwrap();
        let log = FatalErrorLog::new(temp.path());
        log.record(&"é".repeat(3000)).await.unwrap();

        let stored = log.peek().await.unwrap().unwrap();
        assert_eq!(stored.chars().count(), MAX_FATAL_ERROR_LEN);
    }
}
