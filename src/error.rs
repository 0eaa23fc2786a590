//! Error taxonomy shared by the library bridge, cover cache, and MPD adapter.

/// Classified failure reported to callers of the bridge and cover cache.
///
/// `Cancelled` and `Transport` are expected outcomes and are never retried here;
/// the configuration variants short-circuit before any network access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LibraryError {
    #[error("no music server is configured")]
    NoServerConfigured,
    #[error("no path known for '{0}'")]
    NoPathForEntity(String),
    #[error("unable to build a cover URL for '{0}'")]
    UrlConstructionFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to write cache file: {0}")]
    WriteFailed(String),
    /// The server answered with an `ACK` or a reply that could not be parsed.
    #[error("server protocol error: {0}")]
    Protocol(String),
    #[error("playlist name must not be blank")]
    BlankPlaylistName,
    #[error("random album playback is disabled")]
    RandomAlbumDisabled,
}

impl LibraryError {
    /// True for failures that were detected before touching the network.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NoServerConfigured
                | Self::NoPathForEntity(_)
                | Self::UrlConstructionFailed(_)
                | Self::BlankPlaylistName
                | Self::RandomAlbumDisabled
        )
    }
}

impl From<std::io::Error> for LibraryError {
    fn from(error: std::io::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<mpd::error::Error> for LibraryError {
    fn from(error: mpd::error::Error) -> Self {
        match error {
            mpd::error::Error::Io(err) => Self::Transport(err.to_string()),
            mpd::error::Error::Server(err) => Self::Protocol(err.detail),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LibraryError;

    #[test]
    fn test_precondition_classification() {
        assert!(LibraryError::NoServerConfigured.is_precondition());
        assert!(LibraryError::NoPathForEntity("x".to_string()).is_precondition());
        assert!(LibraryError::BlankPlaylistName.is_precondition());
        assert!(!LibraryError::Cancelled.is_precondition());
        assert!(!LibraryError::Transport("reset".to_string()).is_precondition());
    }

    #[test]
    fn test_io_errors_map_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert_eq!(
            LibraryError::from(io),
            LibraryError::Transport("timed out".to_string())
        );
    }
}
