//! Cache-aside bridge between the music server and the in-memory library graph.
//!
//! Reads are answered from the graph when the relevant collection is already
//! populated. Otherwise exactly one request per [`FetchKey`] runs on the worker
//! pool; later identical requests attach to it. Results are applied by a job on
//! the foreground queue, which then runs every attached completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::backends::{MusicServerAdapter, PlayOptions, PlayerCommand, PlayerStatus};
use crate::error::LibraryError;
use crate::foreground::ForegroundHandle;
use crate::model::{Album, Artist, EntityKind, Genre, MusicalEntity, Playlist, Track};
use crate::protocol::{LibraryMessage, Message};
use crate::search::{fuzzy_matches, SearchOptions};
use crate::server_registry::Server;
use crate::worker_pool::{lock_or_recover, WorkerPool};

/// Callback receiving the outcome of a bridge operation on the foreground queue.
pub type Completion<T> = Box<dyn FnOnce(Result<T, LibraryError>) + Send + 'static>;

type Waiter = Box<dyn FnOnce(Result<(), LibraryError>) + Send + 'static>;

/// Completion held by both the worker job and the submitting thread, so a job
/// the pool refuses can still be answered.
type SharedCompletion<T> = Arc<Mutex<Option<Completion<T>>>>;

fn no_worker() -> LibraryError {
    LibraryError::Transport("no worker available for request".to_string())
}

fn random_index(len: usize) -> usize {
    let mut bytes = [0u8; 8];
    if let Err(err) = getrandom::fill(&mut bytes) {
        warn!("EntityBridge: random source unavailable, using the first album: {}", err);
        return 0;
    }
    (u64::from_le_bytes(bytes) % len as u64) as usize
}

/// Request identity used for coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FetchKey {
    Entities(EntityKind),
    AlbumsForArtist { name: String, album_artist: bool },
    AlbumsForGenre(String),
    TracksForAlbum(String),
    PlaylistTracks(String),
}

impl FetchKey {
    fn describe(&self) -> String {
        match self {
            Self::Entities(kind) => format!("load {kind}"),
            Self::AlbumsForArtist { name, .. } => format!("load albums for artist '{name}'"),
            Self::AlbumsForGenre(name) => format!("load albums for genre '{name}'"),
            Self::TracksForAlbum(identifier) => format!("load tracks for album {identifier}"),
            Self::PlaylistTracks(name) => format!("load tracks for playlist '{name}'"),
        }
    }
}

fn non_empty<T: Clone>(items: Option<&Vec<T>>) -> Option<Vec<T>> {
    items.filter(|items| !items.is_empty()).cloned()
}

/// The cached library. Child collections are kept in maps keyed by their
/// parent and mirrored into the parent entities of the listings.
#[derive(Debug, Default)]
pub struct LibraryGraph {
    listings: HashMap<EntityKind, Vec<MusicalEntity>>,
    artist_albums: HashMap<(String, bool), Vec<Album>>,
    genre_albums: HashMap<String, Vec<Album>>,
    album_tracks: HashMap<String, Vec<Track>>,
    playlist_tracks: HashMap<String, Vec<Track>>,
}

impl LibraryGraph {
    pub fn listing(&self, kind: EntityKind) -> &[MusicalEntity] {
        self.listings.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn cached_listing(&self, kind: EntityKind) -> Option<Vec<MusicalEntity>> {
        non_empty(self.listings.get(&kind))
    }

    fn cached_artist_albums(&self, name: &str, album_artist: bool) -> Option<Vec<Album>> {
        non_empty(self.artist_albums.get(&(name.to_string(), album_artist)))
    }

    fn cached_genre_albums(&self, name: &str) -> Option<Vec<Album>> {
        non_empty(self.genre_albums.get(name))
    }

    fn cached_album_tracks(&self, identifier: &str) -> Option<Vec<Track>> {
        non_empty(self.album_tracks.get(identifier))
    }

    fn cached_playlist_tracks(&self, name: &str) -> Option<Vec<Track>> {
        non_empty(self.playlist_tracks.get(name))
    }

    fn store_listing(&mut self, kind: EntityKind, mut entities: Vec<MusicalEntity>) -> usize {
        let album_artist = kind == EntityKind::AlbumArtists;
        for entity in entities.iter_mut() {
            match entity {
                MusicalEntity::Artist(artist) => {
                    let key = (artist.name.clone(), album_artist);
                    if let Some(albums) = self.artist_albums.get(&key) {
                        artist.albums = albums.clone();
                    }
                }
                MusicalEntity::Genre(genre) => {
                    if let Some(albums) = self.genre_albums.get(&genre.name) {
                        genre.albums = albums.clone();
                    }
                }
                MusicalEntity::Album(album) => {
                    if let Some(tracks) = self.album_tracks.get(album.unique_identifier()) {
                        album.tracks = Some(tracks.clone());
                    }
                }
                MusicalEntity::Playlist(playlist) => {
                    if let Some(tracks) = self.playlist_tracks.get(&playlist.name) {
                        playlist.tracks = Some(tracks.clone());
                    }
                }
                MusicalEntity::Track(_) => {}
            }
        }
        let count = entities.len();
        self.listings.insert(kind, entities);
        count
    }

    fn store_artist_albums(
        &mut self,
        name: &str,
        album_artist: bool,
        albums: Vec<Album>,
    ) -> usize {
        let kind = if album_artist {
            EntityKind::AlbumArtists
        } else {
            EntityKind::Artists
        };
        if let Some(listing) = self.listings.get_mut(&kind) {
            for entity in listing.iter_mut() {
                if let MusicalEntity::Artist(artist) = entity {
                    if artist.name == name {
                        artist.albums = albums.clone();
                    }
                }
            }
        }
        let count = albums.len();
        self.artist_albums.insert((name.to_string(), album_artist), albums);
        count
    }

    fn store_genre_albums(&mut self, name: &str, albums: Vec<Album>) -> usize {
        if let Some(listing) = self.listings.get_mut(&EntityKind::Genres) {
            for entity in listing.iter_mut() {
                if let MusicalEntity::Genre(genre) = entity {
                    if genre.name == name {
                        genre.albums = albums.clone();
                    }
                }
            }
        }
        let count = albums.len();
        self.genre_albums.insert(name.to_string(), albums);
        count
    }

    fn store_album_tracks(&mut self, identifier: &str, tracks: Vec<Track>) -> usize {
        if let Some(listing) = self.listings.get_mut(&EntityKind::Albums) {
            for entity in listing.iter_mut() {
                if let MusicalEntity::Album(album) = entity {
                    if album.unique_identifier() == identifier {
                        album.tracks = Some(tracks.clone());
                    }
                }
            }
        }
        let count = tracks.len();
        self.album_tracks.insert(identifier.to_string(), tracks);
        count
    }

    fn store_playlist_tracks(&mut self, name: &str, tracks: Vec<Track>) -> usize {
        if let Some(listing) = self.listings.get_mut(&EntityKind::Playlists) {
            for entity in listing.iter_mut() {
                if let MusicalEntity::Playlist(playlist) = entity {
                    if playlist.name == name {
                        playlist.tracks = Some(tracks.clone());
                    }
                }
            }
        }
        let count = tracks.len();
        self.playlist_tracks.insert(name.to_string(), tracks);
        count
    }

    /// Forgets the listing for `kind` so the next read goes to the server.
    fn invalidate(&mut self, kind: EntityKind) {
        self.listings.remove(&kind);
        if kind == EntityKind::Playlists {
            self.playlist_tracks.clear();
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    server: Option<Server>,
    generation: u64,
}

#[derive(Default)]
struct BridgeShared {
    connection: Mutex<ConnectionState>,
    graph: Mutex<LibraryGraph>,
    in_flight: Mutex<HashMap<FetchKey, Vec<Waiter>>>,
}

impl BridgeShared {
    fn snapshot_connection(&self) -> (Option<Server>, u64) {
        let connection = lock_or_recover(&self.connection);
        (connection.server.clone(), connection.generation)
    }

    fn generation(&self) -> u64 {
        lock_or_recover(&self.connection).generation
    }
}

/// Behaviour switches read from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeOptions {
    pub prefetch_albums_on_connect: bool,
}

/// Cache-aside access to the remote library.
#[derive(Clone)]
pub struct EntityBridge {
    shared: Arc<BridgeShared>,
    adapter: Arc<dyn MusicServerAdapter>,
    pool: WorkerPool,
    foreground: ForegroundHandle,
    bus_sender: broadcast::Sender<Message>,
    options: BridgeOptions,
}

impl EntityBridge {
    pub fn new(
        adapter: Arc<dyn MusicServerAdapter>,
        pool: WorkerPool,
        foreground: ForegroundHandle,
        bus_sender: broadcast::Sender<Message>,
        options: BridgeOptions,
    ) -> Self {
        Self {
            shared: Arc::new(BridgeShared::default()),
            adapter,
            pool,
            foreground,
            bus_sender,
            options,
        }
    }

    fn publish(&self, message: LibraryMessage) {
        let _ = self.bus_sender.send(Message::Library(message));
    }

    pub fn server(&self) -> Option<Server> {
        self.shared.snapshot_connection().0
    }

    /// Switches to `server`, dropping the cached graph.
    ///
    /// Requests still running against the previous server complete their
    /// waiters with [`LibraryError::Cancelled`] and their results are discarded.
    pub fn set_server(&self, server: Option<Server>) {
        let abandoned: Vec<Waiter> = {
            let mut connection = lock_or_recover(&self.shared.connection);
            connection.server = server;
            connection.generation = connection.generation.wrapping_add(1);
            *lock_or_recover(&self.shared.graph) = LibraryGraph::default();
            lock_or_recover(&self.shared.in_flight)
                .drain()
                .flat_map(|(_, waiters)| waiters)
                .collect()
        };
        if !abandoned.is_empty() {
            info!(
                "EntityBridge: server changed, cancelling {} pending request(s)",
                abandoned.len()
            );
        }
        self.publish(LibraryMessage::Cleared);
        for waiter in abandoned {
            waiter(Err(LibraryError::Cancelled));
        }
    }

    /// Pings the active server. Warms the album listing on success when configured to.
    pub fn connect(&self, completion: Completion<()>) {
        let (server, generation) = self.shared.snapshot_connection();
        let Some(server) = server else {
            completion(Err(LibraryError::NoServerConfigured));
            return;
        };
        let pending: SharedCompletion<()> = Arc::new(Mutex::new(Some(completion)));
        let job_completion = Arc::clone(&pending);
        let bridge = self.clone();
        let submitted = self.pool.execute(move || {
            let result = bridge.adapter.ping(&server);
            let finisher = bridge.clone();
            bridge.foreground.post(move || {
                match &result {
                    Ok(()) => {
                        info!("EntityBridge: connected to {}", server);
                        if finisher.options.prefetch_albums_on_connect
                            && finisher.shared.generation() == generation
                        {
                            finisher.entities(EntityKind::Albums, Box::new(|_| {}));
                        }
                    }
                    Err(err) => {
                        warn!("EntityBridge: failed to connect to {}: {}", server, err);
                        finisher.publish(LibraryMessage::OperationFailed {
                            action: format!("connect to {}", server.name),
                            error: err.clone(),
                        });
                    }
                }
                let completion = lock_or_recover(&job_completion).take();
                if let Some(completion) = completion {
                    completion(result);
                }
            });
        });
        if !submitted {
            warn!("EntityBridge: connect could not be scheduled");
            let completion = lock_or_recover(&pending).take();
            if let Some(completion) = completion {
                completion(Err(no_worker()));
            }
        }
    }

    fn fetch<T, R, C, L, S>(
        &self,
        key: FetchKey,
        completion: Completion<T>,
        cached: C,
        load: L,
        store: S,
    ) where
        T: Default + Send + 'static,
        R: Send + 'static,
        C: Fn(&LibraryGraph) -> Option<T> + Send + 'static,
        L: FnOnce(&dyn MusicServerAdapter, &Server) -> Result<R, LibraryError> + Send + 'static,
        S: FnOnce(&mut LibraryGraph, R) -> LibraryMessage + Send + 'static,
    {
        let hit = {
            let graph = lock_or_recover(&self.shared.graph);
            cached(&graph)
        };
        if let Some(value) = hit {
            completion(Ok(value));
            return;
        }

        let (server, generation) = self.shared.snapshot_connection();
        let Some(server) = server else {
            completion(Err(LibraryError::NoServerConfigured));
            return;
        };

        let shared = Arc::clone(&self.shared);
        let waiter: Waiter = Box::new(move |result| match result {
            Ok(()) => {
                let value = {
                    let graph = lock_or_recover(&shared.graph);
                    cached(&graph).unwrap_or_default()
                };
                completion(Ok(value));
            }
            Err(err) => completion(Err(err)),
        });

        {
            let mut in_flight = lock_or_recover(&self.shared.in_flight);
            if let Some(waiters) = in_flight.get_mut(&key) {
                debug!("EntityBridge: coalescing request to {}", key.describe());
                waiters.push(waiter);
                return;
            }
            in_flight.insert(key.clone(), vec![waiter]);
        }

        debug!("EntityBridge: requesting {} from {}", key.describe(), server);
        let bridge = self.clone();
        let job_key = key.clone();
        let submitted = self.pool.execute(move || {
            let result = load(bridge.adapter.as_ref(), &server);
            let finisher = bridge.clone();
            bridge
                .foreground
                .post(move || finisher.finish(job_key, generation, result, store));
        });
        if !submitted {
            self.complete_waiters(&key, Err(no_worker()));
        }
    }

    fn finish<R, S>(
        &self,
        key: FetchKey,
        generation: u64,
        result: Result<R, LibraryError>,
        store: S,
    ) where
        S: FnOnce(&mut LibraryGraph, R) -> LibraryMessage,
    {
        if self.shared.generation() != generation {
            debug!(
                "EntityBridge: discarding result of {} from previous server",
                key.describe()
            );
            return;
        }

        let outcome = match result {
            Ok(value) => {
                let message = {
                    let mut graph = lock_or_recover(&self.shared.graph);
                    store(&mut graph, value)
                };
                self.publish(message);
                Ok(())
            }
            Err(err) => {
                warn!("EntityBridge: failed to {}: {}", key.describe(), err);
                self.publish(LibraryMessage::OperationFailed {
                    action: key.describe(),
                    error: err.clone(),
                });
                Err(err)
            }
        };

        self.complete_waiters(&key, outcome);
    }

    fn complete_waiters(&self, key: &FetchKey, outcome: Result<(), LibraryError>) {
        let waiters = lock_or_recover(&self.shared.in_flight)
            .remove(key)
            .unwrap_or_default();
        for waiter in waiters {
            waiter(outcome.clone());
        }
    }

    /// All entities of `kind`, from cache when populated.
    pub fn entities(&self, kind: EntityKind, completion: Completion<Vec<MusicalEntity>>) {
        self.fetch(
            FetchKey::Entities(kind),
            completion,
            move |graph| graph.cached_listing(kind),
            move |adapter, server| match kind {
                EntityKind::Albums => Ok(adapter
                    .fetch_albums(server)?
                    .into_iter()
                    .map(MusicalEntity::Album)
                    .collect::<Vec<_>>()),
                EntityKind::Artists | EntityKind::AlbumArtists => Ok(adapter
                    .fetch_names(server, kind)?
                    .into_iter()
                    .map(|name| MusicalEntity::Artist(Artist::new(name)))
                    .collect()),
                EntityKind::Genres => Ok(adapter
                    .fetch_names(server, kind)?
                    .into_iter()
                    .map(|name| MusicalEntity::Genre(Genre::new(name)))
                    .collect()),
                EntityKind::Playlists => Ok(adapter
                    .fetch_names(server, kind)?
                    .into_iter()
                    .map(|name| MusicalEntity::Playlist(Playlist::new(name)))
                    .collect()),
            },
            move |graph, entities| LibraryMessage::EntitiesUpdated {
                kind,
                count: graph.store_listing(kind, entities),
            },
        );
    }

    /// Albums by an artist, or by an album artist when `album_artist` is set.
    pub fn albums_for_artist(
        &self,
        artist: &str,
        album_artist: bool,
        completion: Completion<Vec<Album>>,
    ) {
        let cached_name = artist.to_string();
        let load_name = artist.to_string();
        let store_name = artist.to_string();
        self.fetch(
            FetchKey::AlbumsForArtist {
                name: artist.to_string(),
                album_artist,
            },
            completion,
            move |graph| graph.cached_artist_albums(&cached_name, album_artist),
            move |adapter, server| {
                adapter.fetch_albums_for_artist(server, &load_name, album_artist)
            },
            move |graph, albums| LibraryMessage::AlbumsForArtistUpdated {
                count: graph.store_artist_albums(&store_name, album_artist, albums),
                artist: store_name,
                album_artist,
            },
        );
    }

    pub fn albums_for_genre(&self, genre: &str, completion: Completion<Vec<Album>>) {
        let cached_name = genre.to_string();
        let load_name = genre.to_string();
        let store_name = genre.to_string();
        self.fetch(
            FetchKey::AlbumsForGenre(genre.to_string()),
            completion,
            move |graph| graph.cached_genre_albums(&cached_name),
            move |adapter, server| adapter.fetch_albums_for_genre(server, &load_name),
            move |graph, albums| LibraryMessage::AlbumsForGenreUpdated {
                count: graph.store_genre_albums(&store_name, albums),
                genre: store_name,
            },
        );
    }

    /// Tracks of one album, keyed by its unique identifier.
    pub fn tracks_for_album(&self, album: &Album, completion: Completion<Vec<Track>>) {
        let identifier = album.unique_identifier().to_string();
        let cached_identifier = identifier.clone();
        let store_identifier = identifier.clone();
        let album = album.clone();
        self.fetch(
            FetchKey::TracksForAlbum(identifier),
            completion,
            move |graph| graph.cached_album_tracks(&cached_identifier),
            move |adapter, server| adapter.fetch_album_tracks(server, &album),
            move |graph, tracks| LibraryMessage::TracksForAlbumUpdated {
                count: graph.store_album_tracks(&store_identifier, tracks),
                identifier: store_identifier,
            },
        );
    }

    /// Fills `tracks` on every album. Completes once all albums resolved, with
    /// the first error if any failed.
    pub fn tracks_for_albums(&self, albums: Vec<Album>, completion: Completion<Vec<Album>>) {
        struct Gather {
            albums: Vec<Album>,
            remaining: usize,
            error: Option<LibraryError>,
            completion: Option<Completion<Vec<Album>>>,
        }

        if albums.is_empty() {
            completion(Ok(Vec::new()));
            return;
        }
        let requests = albums.clone();
        let gather = Arc::new(Mutex::new(Gather {
            remaining: albums.len(),
            albums,
            error: None,
            completion: Some(completion),
        }));
        for (index, album) in requests.iter().enumerate() {
            let gather = Arc::clone(&gather);
            self.tracks_for_album(
                album,
                Box::new(move |result| {
                    let finished = {
                        let mut state = lock_or_recover(&gather);
                        match result {
                            Ok(tracks) => state.albums[index].tracks = Some(tracks),
                            Err(err) => {
                                state.error.get_or_insert(err);
                            }
                        }
                        state.remaining -= 1;
                        if state.remaining == 0 {
                            let outcome = match state.error.take() {
                                Some(err) => Err(err),
                                None => Ok(std::mem::take(&mut state.albums)),
                            };
                            state.completion.take().map(|completion| (completion, outcome))
                        } else {
                            None
                        }
                    };
                    if let Some((completion, outcome)) = finished {
                        completion(outcome);
                    }
                }),
            );
        }
    }

    pub fn tracks_for_playlist(&self, playlist: &str, completion: Completion<Vec<Track>>) {
        let cached_name = playlist.to_string();
        let load_name = playlist.to_string();
        let store_name = playlist.to_string();
        self.fetch(
            FetchKey::PlaylistTracks(playlist.to_string()),
            completion,
            move |graph| graph.cached_playlist_tracks(&cached_name),
            move |adapter, server| adapter.fetch_playlist_tracks(server, &load_name),
            move |graph, tracks| LibraryMessage::PlaylistTracksUpdated {
                count: graph.store_playlist_tracks(&store_name, tracks),
                playlist: store_name,
            },
        );
    }

    /// Snapshot of the cached listing for `kind`; never touches the network.
    pub fn cached_entities(&self, kind: EntityKind) -> Vec<MusicalEntity> {
        lock_or_recover(&self.shared.graph).listing(kind).to_vec()
    }

    /// Cached entities of every listing whose name fuzzily matches `query`.
    pub fn search(&self, query: &str, options: SearchOptions) -> Vec<MusicalEntity> {
        let graph = lock_or_recover(&self.shared.graph);
        EntityKind::ALL
            .into_iter()
            .flat_map(|kind| graph.listing(kind).iter())
            .filter(|entity| fuzzy_matches(entity.name(), query, options))
            .cloned()
            .collect()
    }

    /// Like [`EntityBridge::search`], restricted to one listing.
    pub fn search_kind(
        &self,
        kind: EntityKind,
        query: &str,
        options: SearchOptions,
    ) -> Vec<MusicalEntity> {
        let graph = lock_or_recover(&self.shared.graph);
        graph
            .listing(kind)
            .iter()
            .filter(|entity| fuzzy_matches(entity.name(), query, options))
            .cloned()
            .collect()
    }

    fn run_remote<T, F>(
        &self,
        action: String,
        announce: bool,
        operation: F,
        completion: Option<Completion<T>>,
    ) where
        T: Send + 'static,
        F: FnOnce(&dyn MusicServerAdapter, &Server) -> Result<T, LibraryError> + Send + 'static,
    {
        let Some(server) = self.server() else {
            self.publish(LibraryMessage::OperationFailed {
                action,
                error: LibraryError::NoServerConfigured,
            });
            if let Some(completion) = completion {
                completion(Err(LibraryError::NoServerConfigured));
            }
            return;
        };
        let pending: SharedCompletion<T> = Arc::new(Mutex::new(completion));
        let job_completion = Arc::clone(&pending);
        let job_action = action.clone();
        let bridge = self.clone();
        let submitted = self.pool.execute(move || {
            let action = job_action;
            let result = operation(bridge.adapter.as_ref(), &server);
            let finisher = bridge.clone();
            bridge.foreground.post(move || {
                match &result {
                    Ok(_) if announce => finisher.publish(LibraryMessage::PlaybackQueued {
                        description: action,
                    }),
                    Ok(_) => debug!("EntityBridge: {} succeeded", action),
                    Err(err) => {
                        warn!("EntityBridge: failed to {}: {}", action, err);
                        finisher.publish(LibraryMessage::OperationFailed {
                            action,
                            error: err.clone(),
                        });
                    }
                }
                let completion = lock_or_recover(&job_completion).take();
                if let Some(completion) = completion {
                    completion(result);
                }
            });
        });
        if !submitted {
            warn!("EntityBridge: failed to {}: could not be scheduled", action);
            self.publish(LibraryMessage::OperationFailed {
                action,
                error: no_worker(),
            });
            let completion = lock_or_recover(&pending).take();
            if let Some(completion) = completion {
                completion(Err(no_worker()));
            }
        }
    }

    pub fn play_album(
        &self,
        album: &Album,
        options: PlayOptions,
        completion: Option<Completion<()>>,
    ) {
        let action = format!("play album '{album}'");
        let album = album.clone();
        self.run_remote(
            action,
            true,
            move |adapter, server| adapter.play_album(server, &album, options),
            completion,
        );
    }

    pub fn play_tracks(
        &self,
        tracks: Vec<Track>,
        options: PlayOptions,
        completion: Option<Completion<()>>,
    ) {
        let action = format!("play {} track(s)", tracks.len());
        self.run_remote(
            action,
            true,
            move |adapter, server| adapter.play_tracks(server, &tracks, options),
            completion,
        );
    }

    pub fn play_playlist(
        &self,
        playlist: &str,
        options: PlayOptions,
        completion: Option<Completion<()>>,
    ) {
        let action = format!("play playlist '{playlist}'");
        let playlist = playlist.to_string();
        self.run_remote(
            action,
            true,
            move |adapter, server| adapter.play_playlist(server, &playlist, options),
            completion,
        );
    }

    /// Appends the album to the play queue without restarting playback.
    pub fn queue_album(&self, album: &Album, completion: Option<Completion<()>>) {
        let action = format!("queue album '{album}'");
        let album = album.clone();
        self.run_remote(
            action,
            true,
            move |adapter, server| adapter.queue_album(server, &album),
            completion,
        );
    }

    fn play_every_track(
        &self,
        albums: Vec<Album>,
        options: PlayOptions,
        completion: Option<Completion<()>>,
    ) {
        let bridge = self.clone();
        self.tracks_for_albums(
            albums,
            Box::new(move |result| match result {
                Ok(albums) => {
                    let tracks: Vec<Track> = albums
                        .into_iter()
                        .flat_map(|album| album.tracks.unwrap_or_default())
                        .collect();
                    bridge.play_tracks(tracks, options, completion);
                }
                Err(err) => {
                    if let Some(completion) = completion {
                        completion(Err(err));
                    }
                }
            }),
        );
    }

    /// Replaces the queue with every track of every album by `artist`.
    pub fn play_artist_albums(
        &self,
        artist: &str,
        album_artist: bool,
        options: PlayOptions,
        completion: Option<Completion<()>>,
    ) {
        let bridge = self.clone();
        self.albums_for_artist(
            artist,
            album_artist,
            Box::new(move |result| match result {
                Ok(albums) => bridge.play_every_track(albums, options, completion),
                Err(err) => {
                    if let Some(completion) = completion {
                        completion(Err(err));
                    }
                }
            }),
        );
    }

    pub fn play_genre_albums(
        &self,
        genre: &str,
        options: PlayOptions,
        completion: Option<Completion<()>>,
    ) {
        let bridge = self.clone();
        self.albums_for_genre(
            genre,
            Box::new(move |result| match result {
                Ok(albums) => bridge.play_every_track(albums, options, completion),
                Err(err) => {
                    if let Some(completion) = completion {
                        completion(Err(err));
                    }
                }
            }),
        );
    }

    /// Plays one album picked at random from the album listing. Completes with
    /// `None` when the library has no albums.
    pub fn play_random_album(&self, options: PlayOptions, completion: Completion<Option<Album>>) {
        let bridge = self.clone();
        self.entities(
            EntityKind::Albums,
            Box::new(move |result| {
                let albums: Vec<Album> = match result {
                    Ok(entities) => entities
                        .iter()
                        .filter_map(MusicalEntity::as_album)
                        .cloned()
                        .collect(),
                    Err(err) => {
                        completion(Err(err));
                        return;
                    }
                };
                if albums.is_empty() {
                    completion(Ok(None));
                    return;
                }
                let album = albums[random_index(albums.len())].clone();
                info!("EntityBridge: playing random album {}", album);
                let picked = album.clone();
                bridge.play_album(
                    &album,
                    options,
                    Some(Box::new(move |result| completion(result.map(|()| Some(picked))))),
                );
            }),
        );
    }

    /// Runs a playlist change, then reloads the playlists listing and
    /// completes with it.
    fn change_playlists<F>(
        &self,
        action: String,
        operation: F,
        completion: Completion<Vec<MusicalEntity>>,
    ) where
        F: FnOnce(&dyn MusicServerAdapter, &Server) -> Result<(), LibraryError> + Send + 'static,
    {
        let bridge = self.clone();
        self.run_remote(
            action,
            false,
            operation,
            Some(Box::new(move |result| match result {
                Ok(()) => {
                    lock_or_recover(&bridge.shared.graph).invalidate(EntityKind::Playlists);
                    bridge.entities(EntityKind::Playlists, completion);
                }
                Err(err) => completion(Err(err)),
            })),
        );
    }

    /// Saves the current queue as a new playlist named `name`.
    pub fn create_playlist(&self, name: &str, completion: Completion<Vec<MusicalEntity>>) {
        if name.trim().is_empty() {
            completion(Err(LibraryError::BlankPlaylistName));
            return;
        }
        let name = name.to_string();
        self.change_playlists(
            format!("create playlist '{name}'"),
            move |adapter, server| adapter.save_playlist(server, &name),
            completion,
        );
    }

    pub fn rename_playlist(
        &self,
        name: &str,
        new_name: &str,
        completion: Completion<Vec<MusicalEntity>>,
    ) {
        if name.trim().is_empty() || new_name.trim().is_empty() {
            completion(Err(LibraryError::BlankPlaylistName));
            return;
        }
        let name = name.to_string();
        let new_name = new_name.to_string();
        self.change_playlists(
            format!("rename playlist '{name}' to '{new_name}'"),
            move |adapter, server| adapter.rename_playlist(server, &name, &new_name),
            completion,
        );
    }

    pub fn delete_playlist(&self, name: &str, completion: Completion<Vec<MusicalEntity>>) {
        if name.trim().is_empty() {
            completion(Err(LibraryError::BlankPlaylistName));
            return;
        }
        let name = name.to_string();
        self.change_playlists(
            format!("delete playlist '{name}'"),
            move |adapter, server| adapter.delete_playlist(server, &name),
            completion,
        );
    }

    pub fn player_command(&self, command: PlayerCommand, completion: Option<Completion<()>>) {
        self.run_remote(
            format!("send {command:?}"),
            false,
            move |adapter, server| adapter.send_command(server, command),
            completion,
        );
    }

    pub fn player_status(&self, completion: Completion<PlayerStatus>) {
        self.run_remote(
            "read player status".to_string(),
            false,
            |adapter, server| adapter.fetch_status(server),
            Some(completion),
        );
    }
}
