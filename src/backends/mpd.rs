//! MPD adapter on top of the blocking `mpd` client.
//!
//! Each adapter call opens a short-lived session: connect, authenticate, run
//! the commands, drop the connection.

use std::collections::HashSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;
use mpd::status::State;
use mpd::{Client, Query, Song, Term};

use crate::backends::{
    MusicServerAdapter, PlayOptions, PlaybackState, PlayerCommand, PlayerStatus,
};
use crate::error::LibraryError;
use crate::model::{sort_tracks, Album, EntityKind, Track};
use crate::server_registry::Server;

const PAGE_SIZE: u32 = 1000;

fn tag<'a>(song: &'a Song, name: &str) -> Option<&'a str> {
    song.tags
        .iter()
        .find(|(key, value)| key.eq_ignore_ascii_case(name) && !value.is_empty())
        .map(|(_, value)| value.as_str())
}

fn leading_number(value: Option<&str>) -> u32 {
    value
        .and_then(|value| value.split('/').next())
        .and_then(|number| number.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

fn year(song: &Song) -> String {
    tag(song, "Date")
        .map(|date| date.chars().take(4).collect())
        .unwrap_or_default()
}

/// Album artist when tagged, otherwise the track artist.
fn grouping_artist(song: &Song) -> &str {
    tag(song, "AlbumArtist")
        .or(song.artist.as_deref())
        .unwrap_or_default()
}

/// Parent directory of the song, relative to the music root.
fn directory(file: &str) -> &str {
    match file.rfind('/') {
        Some(index) => &file[..index],
        None => "",
    }
}

fn track_from_song(song: Song) -> Track {
    let title = match song.title.as_deref().filter(|title| !title.is_empty()) {
        Some(title) => title.to_string(),
        None => song.file.rsplit('/').next().unwrap_or_default().to_string(),
    };
    Track {
        title,
        artist: song.artist.clone().unwrap_or_default(),
        album: tag(&song, "Album").unwrap_or_default().to_string(),
        track_number: leading_number(tag(&song, "Track")),
        disc_number: leading_number(tag(&song, "Disc")),
        duration_secs: song
            .duration
            .map(|duration| duration.as_secs_f64().round() as u32)
            .unwrap_or(0),
        uri: song.file,
    }
}

/// Folds songs into albums keyed by album name and album artist (or artist).
fn group_albums(songs: &[Song]) -> Vec<Album> {
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let mut albums: Vec<Album> = Vec::new();
    for song in songs {
        let Some(name) = tag(song, "Album") else {
            continue;
        };
        let artist = grouping_artist(song);
        if !seen.insert((name, artist)) {
            continue;
        }
        let genre = tag(song, "Genre").unwrap_or_default();
        let parent = directory(&song.file);
        let album = if parent.is_empty() {
            let mut album = Album::new(name);
            album.artist = artist.to_string();
            album.genre = genre.to_string();
            album.year = year(song);
            album
        } else {
            Album::with_details(name, parent, artist, genre, year(song))
        };
        albums.push(album);
    }
    albums.sort();
    albums
}

/// Songs of `album`, restricted to its directory when the path is known.
fn album_query(album: &Album) -> Query<'_> {
    let mut query = Query::new();
    if let Some(path) = album.path.as_deref().filter(|path| !path.is_empty()) {
        query.and(Term::Base, path);
    }
    query.and(Term::Tag("Album".into()), album.name.as_str());
    query
}

fn playback_state(state: State) -> PlaybackState {
    match state {
        State::Play => PlaybackState::Playing,
        State::Pause => PlaybackState::Paused,
        State::Stop => PlaybackState::Stopped,
    }
}

/// MPD reports -1 when the output has no mixer.
fn volume_percent(volume: i8) -> Option<u8> {
    u8::try_from(volume).ok().map(|volume| volume.min(100))
}

fn find_paged(client: &mut Client, query: &Query) -> Result<Vec<Song>, LibraryError> {
    let mut songs = Vec::new();
    let mut offset = 0u32;
    loop {
        let page = client.find(query, (offset, offset.saturating_add(PAGE_SIZE)))?;
        let reached_end = page.len() < PAGE_SIZE as usize;
        offset = offset.saturating_add(page.len() as u32);
        songs.extend(page);
        if reached_end {
            break;
        }
    }
    Ok(songs)
}

/// MPD adapter backed by blocking `mpd::Client` sessions.
pub struct MpdAdapter {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl MpdAdapter {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }

    fn session(&self, server: &Server) -> Result<Client, LibraryError> {
        let addresses = (server.hostname.as_str(), server.port)
            .to_socket_addrs()
            .map_err(|err| {
                LibraryError::Transport(format!("failed to resolve {}: {err}", server.hostname))
            })?;
        let mut last_error = format!("no address for {}", server.hostname);
        let mut stream = None;
        for address in addresses {
            match TcpStream::connect_timeout(&address, self.connect_timeout) {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(err) => last_error = format!("failed to connect to {address}: {err}"),
            }
        }
        let stream = stream.ok_or(LibraryError::Transport(last_error))?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;

        let mut client = Client::new(stream)?;
        debug!("MpdAdapter: connected to {}:{}", server.hostname, server.port);
        if let Some(password) = server.password.as_deref().filter(|value| !value.is_empty()) {
            client.login(password)?;
        }
        Ok(client)
    }

    fn albums_matching(&self, server: &Server, query: &Query) -> Result<Vec<Album>, LibraryError> {
        let mut client = self.session(server)?;
        let songs = find_paged(&mut client, query)?;
        Ok(group_albums(&songs))
    }

    /// Clears the queue, lets `fill` add the new content, applies the options
    /// and starts from the top.
    fn replace_queue<F>(
        &self,
        server: &Server,
        options: PlayOptions,
        fill: F,
    ) -> Result<(), LibraryError>
    where
        F: FnOnce(&mut Client) -> Result<(), LibraryError>,
    {
        let mut client = self.session(server)?;
        client.clear()?;
        fill(&mut client)?;
        client.random(options.shuffle)?;
        client.repeat(options.repeat)?;
        client.play()?;
        Ok(())
    }
}

impl Default for MpdAdapter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(15))
    }
}

impl MusicServerAdapter for MpdAdapter {
    fn ping(&self, server: &Server) -> Result<(), LibraryError> {
        self.session(server)?.ping()?;
        Ok(())
    }

    fn fetch_albums(&self, server: &Server) -> Result<Vec<Album>, LibraryError> {
        let mut query = Query::new();
        query.and(Term::Base, "");
        self.albums_matching(server, &query)
    }

    fn fetch_names(&self, server: &Server, kind: EntityKind) -> Result<Vec<String>, LibraryError> {
        let mut client = self.session(server)?;
        let listed = match kind {
            EntityKind::Playlists => client
                .playlists()?
                .into_iter()
                .map(|playlist| playlist.name)
                .collect(),
            EntityKind::Artists => client.list(&Term::Tag("Artist".into()), &Query::new())?,
            EntityKind::AlbumArtists => {
                client.list(&Term::Tag("AlbumArtist".into()), &Query::new())?
            }
            EntityKind::Genres => client.list(&Term::Tag("Genre".into()), &Query::new())?,
            EntityKind::Albums => client.list(&Term::Tag("Album".into()), &Query::new())?,
        };
        let mut names: Vec<String> = Vec::new();
        for name in listed {
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn fetch_albums_for_artist(
        &self,
        server: &Server,
        artist: &str,
        album_artist: bool,
    ) -> Result<Vec<Album>, LibraryError> {
        let tag_name = if album_artist { "AlbumArtist" } else { "Artist" };
        let mut query = Query::new();
        query.and(Term::Tag(tag_name.into()), artist);
        self.albums_matching(server, &query)
    }

    fn fetch_albums_for_genre(
        &self,
        server: &Server,
        genre: &str,
    ) -> Result<Vec<Album>, LibraryError> {
        let mut query = Query::new();
        query.and(Term::Tag("Genre".into()), genre);
        self.albums_matching(server, &query)
    }

    fn fetch_album_tracks(
        &self,
        server: &Server,
        album: &Album,
    ) -> Result<Vec<Track>, LibraryError> {
        let mut client = self.session(server)?;
        let songs = find_paged(&mut client, &album_query(album))?;
        let mut tracks: Vec<Track> = songs.into_iter().map(track_from_song).collect();
        sort_tracks(&mut tracks);
        Ok(tracks)
    }

    fn fetch_playlist_tracks(
        &self,
        server: &Server,
        playlist: &str,
    ) -> Result<Vec<Track>, LibraryError> {
        let songs = self.session(server)?.playlist(playlist)?;
        Ok(songs.into_iter().map(track_from_song).collect())
    }

    fn play_album(
        &self,
        server: &Server,
        album: &Album,
        options: PlayOptions,
    ) -> Result<(), LibraryError> {
        self.replace_queue(server, options, |client| {
            client.findadd(&album_query(album))?;
            Ok(())
        })
    }

    fn play_tracks(
        &self,
        server: &Server,
        tracks: &[Track],
        options: PlayOptions,
    ) -> Result<(), LibraryError> {
        if tracks.is_empty() {
            return Ok(());
        }
        self.replace_queue(server, options, |client| {
            for track in tracks {
                client.push(Song {
                    file: track.uri.clone(),
                    ..Default::default()
                })?;
            }
            Ok(())
        })
    }

    fn play_playlist(
        &self,
        server: &Server,
        playlist: &str,
        options: PlayOptions,
    ) -> Result<(), LibraryError> {
        self.replace_queue(server, options, |client| {
            client.load(playlist, ..)?;
            Ok(())
        })
    }

    fn queue_album(&self, server: &Server, album: &Album) -> Result<(), LibraryError> {
        self.session(server)?.findadd(&album_query(album))?;
        Ok(())
    }

    fn save_playlist(&self, server: &Server, name: &str) -> Result<(), LibraryError> {
        self.session(server)?.save(name)?;
        Ok(())
    }

    fn rename_playlist(
        &self,
        server: &Server,
        name: &str,
        new_name: &str,
    ) -> Result<(), LibraryError> {
        self.session(server)?.pl_rename(name, new_name)?;
        Ok(())
    }

    fn delete_playlist(&self, server: &Server, name: &str) -> Result<(), LibraryError> {
        self.session(server)?.pl_remove(name)?;
        Ok(())
    }

    fn send_command(&self, server: &Server, command: PlayerCommand) -> Result<(), LibraryError> {
        let mut client = self.session(server)?;
        match command {
            PlayerCommand::Play => client.play()?,
            PlayerCommand::TogglePause => client.toggle_pause()?,
            PlayerCommand::Stop => client.stop()?,
            PlayerCommand::Next => client.next()?,
            PlayerCommand::Previous => client.prev()?,
            PlayerCommand::SetVolume(volume) => client.volume(volume.min(100) as i8)?,
        }
        Ok(())
    }

    fn fetch_status(&self, server: &Server) -> Result<PlayerStatus, LibraryError> {
        let status = self.session(server)?.status()?;
        Ok(PlayerStatus {
            state: playback_state(status.state),
            volume: volume_percent(status.volume),
            song_position: status.song.map(|place| place.pos),
            elapsed_secs: status.elapsed.map(|elapsed| elapsed.as_secs_f64()),
            random: status.random,
            repeat: status.repeat,
            queue_length: status.queue_len,
        })
    }
}
