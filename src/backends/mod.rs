//! Music server adapter abstractions and concrete implementations.

pub mod mpd;

use crate::error::LibraryError;
use crate::model::{Album, EntityKind, Track};
use crate::server_registry::Server;

/// Queue options applied when starting playback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayOptions {
    pub shuffle: bool,
    pub repeat: bool,
}

/// Transport-level player commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerCommand {
    Play,
    TogglePause,
    Stop,
    Next,
    Previous,
    /// Volume in percent; values above 100 are clamped.
    SetVolume(u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    #[default]
    Stopped,
}

/// Snapshot of the server-side player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    /// `None` when the server has no mixer.
    pub volume: Option<u8>,
    pub song_position: Option<u32>,
    pub elapsed_secs: Option<f64>,
    pub random: bool,
    pub repeat: bool,
    pub queue_length: u32,
}

/// Interface implemented by concrete music server protocols.
///
/// Every call is blocking and self-contained; callers run them on the worker
/// pool.
pub trait MusicServerAdapter: Send + Sync {
    fn ping(&self, server: &Server) -> Result<(), LibraryError>;
    fn fetch_albums(&self, server: &Server) -> Result<Vec<Album>, LibraryError>;
    /// Names for the name-only listings (artists, album artists, genres, playlists).
    fn fetch_names(&self, server: &Server, kind: EntityKind) -> Result<Vec<String>, LibraryError>;
    fn fetch_albums_for_artist(
        &self,
        server: &Server,
        artist: &str,
        album_artist: bool,
    ) -> Result<Vec<Album>, LibraryError>;
    fn fetch_albums_for_genre(
        &self,
        server: &Server,
        genre: &str,
    ) -> Result<Vec<Album>, LibraryError>;
    fn fetch_album_tracks(
        &self,
        server: &Server,
        album: &Album,
    ) -> Result<Vec<Track>, LibraryError>;
    fn fetch_playlist_tracks(
        &self,
        server: &Server,
        playlist: &str,
    ) -> Result<Vec<Track>, LibraryError>;
    fn play_album(
        &self,
        server: &Server,
        album: &Album,
        options: PlayOptions,
    ) -> Result<(), LibraryError>;
    fn play_tracks(
        &self,
        server: &Server,
        tracks: &[Track],
        options: PlayOptions,
    ) -> Result<(), LibraryError>;
    fn play_playlist(
        &self,
        server: &Server,
        playlist: &str,
        options: PlayOptions,
    ) -> Result<(), LibraryError>;
    /// Appends the album to the queue without touching playback.
    fn queue_album(&self, server: &Server, album: &Album) -> Result<(), LibraryError>;
    /// Stores the current queue as a playlist named `name`.
    fn save_playlist(&self, server: &Server, name: &str) -> Result<(), LibraryError>;
    fn rename_playlist(
        &self,
        server: &Server,
        name: &str,
        new_name: &str,
    ) -> Result<(), LibraryError>;
    fn delete_playlist(&self, server: &Server, name: &str) -> Result<(), LibraryError>;
    fn send_command(&self, server: &Server, command: PlayerCommand) -> Result<(), LibraryError>;
    fn fetch_status(&self, server: &Server) -> Result<PlayerStatus, LibraryError>;
}
