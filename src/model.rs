//! Library entity model: genres, artists, albums, tracks and playlists.
//!
//! Entities compare by their visible fields, never by identity. Album hashing
//! uses the djb2 value hash; the SHA-256 `unique_identifier` is reserved for the
//! cover cache.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::identity::{djb2, identifier_for};

/// Listing types offered by the library browser.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[default]
    Albums,
    Artists,
    AlbumArtists,
    Genres,
    Playlists,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Albums,
        EntityKind::Artists,
        EntityKind::AlbumArtists,
        EntityKind::Genres,
        EntityKind::Playlists,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Albums => "albums",
            Self::Artists => "artists",
            Self::AlbumArtists => "album_artists",
            Self::Genres => "genres",
            Self::Playlists => "playlists",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown entity kind '{value}'"))
    }
}

/// One song as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Track {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub track_number: u32,
    pub disc_number: u32,
    pub duration_secs: u32,
    /// Server-relative file URI.
    pub uri: String,
}

impl Track {
    fn sort_key(&self) -> (u32, u32, &str) {
        (self.disc_number, self.track_number, self.uri.as_str())
    }
}

/// Sorts tracks by disc, then track number, then URI.
pub fn sort_tracks(tracks: &mut [Track]) {
    tracks.sort_by(|left, right| left.sort_key().cmp(&right.sort_key()));
}

/// An album and its cache identity.
#[derive(Debug, Clone)]
pub struct Album {
    pub name: String,
    pub artist: String,
    pub genre: String,
    pub year: String,
    pub path: Option<String>,
    pub tracks: Option<Vec<Track>>,
    unique_identifier: String,
}

impl Album {
    /// Album known only by name. Its identifier falls back to the name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            unique_identifier: identifier_for(&name),
            name,
            artist: String::new(),
            genre: String::new(),
            year: String::new(),
            path: None,
            tracks: None,
        }
    }

    /// Album with a known directory path; the identifier is derived from the path.
    pub fn with_details(
        name: impl Into<String>,
        path: impl Into<String>,
        artist: impl Into<String>,
        genre: impl Into<String>,
        year: impl Into<String>,
    ) -> Self {
        let path = path.into();
        Self {
            unique_identifier: identifier_for(&path),
            name: name.into(),
            artist: artist.into(),
            genre: genre.into(),
            year: year.into(),
            path: Some(path),
            tracks: None,
        }
    }

    pub fn unique_identifier(&self) -> &str {
        &self.unique_identifier
    }

    /// Location of this album's cover inside `cache_root`.
    pub fn local_cover_path(&self, cache_root: &Path) -> PathBuf {
        cache_root.join(format!("{}.jpg", self.unique_identifier))
    }

    fn sort_key(&self) -> (&str, &str, &str, &str) {
        (&self.name, &self.artist, &self.year, &self.genre)
    }
}

impl PartialEq for Album {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for Album {}

impl Hash for Album {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(djb2(&self.name) ^ djb2(&self.genre) ^ djb2(&self.year));
    }
}

impl PartialOrd for Album {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Album {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for Album {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.artist.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} - {}", self.artist, self.name)
        }
    }
}

macro_rules! album_container {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            pub name: String,
            /// Filled lazily by the entity bridge.
            pub albums: Vec<Album>,
        }

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self {
                    name: name.into(),
                    albums: Vec::new(),
                }
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.name == other.name
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                state.write_u32(djb2(&self.name));
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.name.cmp(&other.name)
            }
        }
    };
}

album_container!(
    /// A genre and the albums tagged with it.
    Genre
);
album_container!(
    /// An artist (track artist or album artist) and their albums.
    Artist
);

/// A stored playlist on the server.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    pub name: String,
    pub tracks: Option<Vec<Track>>,
}

impl Playlist {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tracks: None,
        }
    }
}

impl PartialEq for Playlist {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Playlist {}

impl Hash for Playlist {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(djb2(&self.name));
    }
}

/// Any entity that can appear in a library listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MusicalEntity {
    Genre(Genre),
    Artist(Artist),
    Album(Album),
    Track(Track),
    Playlist(Playlist),
}

impl MusicalEntity {
    /// Display name used for listings and search.
    pub fn name(&self) -> &str {
        match self {
            Self::Genre(genre) => &genre.name,
            Self::Artist(artist) => &artist.name,
            Self::Album(album) => &album.name,
            Self::Track(track) => &track.title,
            Self::Playlist(playlist) => &playlist.name,
        }
    }

    pub fn as_album(&self) -> Option<&Album> {
        match self {
            Self::Album(album) => Some(album),
            _ => None,
        }
    }

    pub fn as_artist(&self) -> Option<&Artist> {
        match self {
            Self::Artist(artist) => Some(artist),
            _ => None,
        }
    }

    pub fn as_genre(&self) -> Option<&Genre> {
        match self {
            Self::Genre(genre) => Some(genre),
            _ => None,
        }
    }

    pub fn as_playlist(&self) -> Option<&Playlist> {
        match self {
            Self::Playlist(playlist) => Some(playlist),
            _ => None,
        }
    }
}
