//! Event-bus protocol shared by all runtime components.
//!
//! The bridge, cover cache, registry and discovery publish here; presentation
//! code subscribes and never calls back into the core from a receiver.

use std::path::PathBuf;

use crate::error::LibraryError;
use crate::model::EntityKind;
use crate::server_registry::Server;

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Library(LibraryMessage),
    Cover(CoverMessage),
    Server(ServerMessage),
}

/// Library graph notifications.
#[derive(Debug, Clone)]
pub enum LibraryMessage {
    EntitiesUpdated {
        kind: EntityKind,
        count: usize,
    },
    AlbumsForArtistUpdated {
        artist: String,
        album_artist: bool,
        count: usize,
    },
    AlbumsForGenreUpdated {
        genre: String,
        count: usize,
    },
    /// Tracks were cached for the album with this unique identifier.
    TracksForAlbumUpdated {
        identifier: String,
        count: usize,
    },
    PlaylistTracksUpdated {
        playlist: String,
        count: usize,
    },
    /// The graph was dropped because the active server changed.
    Cleared,
    PlaybackQueued {
        description: String,
    },
    /// User-facing failure report. `action` names what was attempted.
    OperationFailed {
        action: String,
        error: LibraryError,
    },
}

/// Cover download outcomes.
#[derive(Debug, Clone)]
pub enum CoverMessage {
    CoverCached {
        identifier: String,
        path: PathBuf,
    },
    CoverFailed {
        identifier: String,
        error: LibraryError,
    },
    CoverCancelled {
        identifier: String,
    },
}

/// Server registry and discovery notifications.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    ActiveServerChanged { name: Option<String> },
    ServerDiscovered(Server),
    DiscoveryStarted,
    DiscoveryStopped,
}
