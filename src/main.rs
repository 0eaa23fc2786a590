use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, warn};

use mpdshelf::app_context::AppContext;
use mpdshelf::backends::mpd::MpdAdapter;
use mpdshelf::backends::{PlayOptions, PlayerCommand};
use mpdshelf::config_persistence::load_config_file;
use mpdshelf::cover_cache::CoverOutcome;
use mpdshelf::cover_transport::HttpCoverTransport;
use mpdshelf::entity_bridge::Completion;
use mpdshelf::error::LibraryError;
use mpdshelf::foreground::ForegroundQueue;
use mpdshelf::model::{Album, EntityKind, MusicalEntity};
use mpdshelf::server_keyring::{delete_server_password, get_server_password, set_server_password};
use mpdshelf::worker_pool::lock_or_recover;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "mpdshelf")]
#[command(version)]
#[command(about = "Browse an MPD library, cache cover art and control playback")]
struct Cli {
    /// Path to the config TOML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured and discovered servers
    Servers,
    /// Browse the network for servers
    Discover {
        /// How long to browse
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
    /// Make a server the active one
    Use { name: String },
    /// List albums, artists, album_artists, genres or playlists
    List { kind: Option<EntityKind> },
    /// Albums of an artist or a genre
    Albums {
        #[arg(long, conflicts_with = "genre")]
        artist: Option<String>,
        /// Match the album artist tag instead of the artist tag
        #[arg(long, requires = "artist")]
        album_artist: bool,
        #[arg(long)]
        genre: Option<String>,
    },
    /// Tracks of an album
    Tracks { album: String },
    /// Tracks of a stored playlist
    Playlist {
        name: String,
        /// Replace the queue with the playlist and start playing
        #[arg(long)]
        play: bool,
    },
    /// Fuzzy search over every listing
    Search {
        query: String,
        #[arg(long)]
        kind: Option<EntityKind>,
    },
    /// Download missing album covers into the cache
    Covers {
        /// Only albums whose name matches
        query: Option<String>,
    },
    /// Replace the queue with an album and start playing
    Play {
        album: String,
        #[arg(long)]
        shuffle: bool,
        #[arg(long)]
        repeat: bool,
    },
    /// Append an album to the play queue
    Queue { album: String },
    /// Replace the queue with every album of an artist or a genre
    PlayAll {
        #[arg(long, conflicts_with = "genre")]
        artist: Option<String>,
        /// Match the album artist tag instead of the artist tag
        #[arg(long, requires = "artist")]
        album_artist: bool,
        #[arg(long)]
        genre: Option<String>,
        #[arg(long)]
        shuffle: bool,
        #[arg(long)]
        repeat: bool,
    },
    /// Play an album picked at random
    Random,
    /// Create, rename or delete stored playlists
    Playlists {
        #[command(subcommand)]
        action: PlaylistAction,
    },
    /// Send a transport command
    Control {
        #[command(subcommand)]
        action: ControlAction,
    },
    /// Show the player status
    Status,
    /// Store or delete the password of a configured server
    Password {
        name: String,
        #[arg(long)]
        delete: bool,
    },
}

#[derive(Subcommand)]
enum PlaylistAction {
    /// Save the current queue as a new playlist
    Create { name: String },
    Rename { name: String, new_name: String },
    Delete { name: String },
}

#[derive(Subcommand, Clone, Copy)]
enum ControlAction {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    Volume { percent: u8 },
}

impl From<ControlAction> for PlayerCommand {
    fn from(action: ControlAction) -> Self {
        match action {
            ControlAction::Play => PlayerCommand::Play,
            ControlAction::Pause => PlayerCommand::TogglePause,
            ControlAction::Stop => PlayerCommand::Stop,
            ControlAction::Next => PlayerCommand::Next,
            ControlAction::Previous => PlayerCommand::Previous,
            ControlAction::Volume { percent } => PlayerCommand::SetVolume(percent),
        }
    }
}

/// Starts an asynchronous request and drives the foreground queue until its
/// completion runs.
fn wait_for<T, F>(queue: &ForegroundQueue, start: F) -> Result<T, LibraryError>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>),
{
    let slot: Arc<Mutex<Option<Result<T, LibraryError>>>> = Arc::new(Mutex::new(None));
    let writer = Arc::clone(&slot);
    start(Box::new(move |result| {
        *lock_or_recover(&writer) = Some(result);
    }));
    queue.run_until(REQUEST_TIMEOUT, || lock_or_recover(&slot).is_some());
    let result = lock_or_recover(&slot).take();
    result.unwrap_or_else(|| {
        Err(LibraryError::Transport(
            "timed out waiting for the server".to_string(),
        ))
    })
}

fn connect(context: &AppContext, queue: &ForegroundQueue) -> Result<(), LibraryError> {
    wait_for(queue, |done| context.bridge.connect(done))
}

fn load_listing(
    context: &AppContext,
    queue: &ForegroundQueue,
    kind: EntityKind,
) -> Result<Vec<MusicalEntity>, LibraryError> {
    wait_for(queue, |done| context.bridge.entities(kind, done))
}

fn find_album(
    context: &AppContext,
    queue: &ForegroundQueue,
    name: &str,
) -> Result<Album, Box<dyn std::error::Error>> {
    load_listing(context, queue, EntityKind::Albums)?;
    let matches: Vec<Album> = context
        .bridge
        .search_kind(EntityKind::Albums, name, context.search_options())
        .iter()
        .filter_map(MusicalEntity::as_album)
        .cloned()
        .collect();
    matches
        .iter()
        .find(|album| album.name.eq_ignore_ascii_case(name))
        .or_else(|| matches.first())
        .cloned()
        .ok_or_else(|| format!("no album matches '{name}'").into())
}

fn print_albums(albums: &[Album]) {
    for album in albums {
        if album.year.is_empty() {
            println!("{}  {}", album.name, album.artist);
        } else {
            println!("{}  {}  ({})", album.name, album.artist, album.year);
        }
    }
}

fn entity_label(entity: &MusicalEntity) -> &'static str {
    match entity {
        MusicalEntity::Genre(_) => "genre",
        MusicalEntity::Artist(_) => "artist",
        MusicalEntity::Album(_) => "album",
        MusicalEntity::Track(_) => "track",
        MusicalEntity::Playlist(_) => "playlist",
    }
}

fn format_duration(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

fn default_config_file() -> Result<PathBuf, String> {
    dirs::config_dir()
        .map(|dir| dir.join("mpdshelf").join("config.toml"))
        .ok_or_else(|| "no configuration directory available".to_string())
}

fn read_password_from_stdin() -> Result<String, String> {
    println!("Password:");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| format!("failed to read password: {err}"))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Info);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let cli = Cli::parse();
    let config_file = match cli.config {
        Some(path) => path,
        None => default_config_file()?,
    };
    let config = load_config_file(&config_file);
    info!("Loaded config from {}", config_file.display());

    if let Commands::Password { name, delete } = &cli.command {
        let server = config
            .servers
            .iter()
            .find(|server| &server.name == name)
            .ok_or_else(|| format!("no configured server named '{name}'"))?;
        if *delete {
            delete_server_password(&server.hostname, server.port)?;
            println!("Deleted password for {}", server.name);
        } else {
            let password = read_password_from_stdin()?;
            set_server_password(&server.hostname, server.port, &password)?;
            println!("Stored password for {}", server.name);
        }
        return Ok(());
    }

    let adapter = MpdAdapter::new(
        Duration::from_secs(config.connection.connect_timeout_secs),
        Duration::from_secs(config.connection.io_timeout_secs),
    );
    let transport = HttpCoverTransport::new(
        config.covers.trust_policy,
        Duration::from_secs(config.covers.transfer_timeout_secs),
    )?;
    let passwords = |hostname: &str, port: u16| match get_server_password(hostname, port) {
        Ok(password) => password,
        Err(err) => {
            warn!("Failed to read password for {}:{}: {}", hostname, port, err);
            None
        }
    };
    let queue = ForegroundQueue::new();
    let context = AppContext::new(
        config,
        Some(config_file),
        Arc::new(adapter),
        Arc::new(transport),
        queue.handle(),
        &passwords,
    )?;

    match cli.command {
        Commands::Servers => {
            let active = context.active_server();
            let registry = lock_or_recover(&context.registry);
            for server in registry.all_servers() {
                let marker = if active.as_ref() == Some(&server) { "*" } else { " " };
                println!("{marker} {server}");
            }
        }
        Commands::Discover { seconds } => {
            context.start_discovery()?;
            queue.run_until(Duration::from_secs(seconds), || false);
            context.stop_discovery();
            queue.run_pending();
            let discovered = lock_or_recover(&context.registry).discovered_servers();
            if discovered.is_empty() {
                println!("No servers found");
            }
            for server in discovered {
                println!("  {server}");
            }
        }
        Commands::Use { name } => {
            if lock_or_recover(&context.registry).find_by_name(&name).is_none()
                && context.start_discovery().is_ok()
            {
                let registry = Arc::clone(&context.registry);
                queue.run_until(Duration::from_secs(5), || {
                    lock_or_recover(&registry).find_by_name(&name).is_some()
                });
                context.stop_discovery();
            }
            let server = context.select_server(&name)?;
            connect(&context, &queue)?;
            println!("Using {server}");
        }
        Commands::List { kind } => {
            let kind = kind.unwrap_or(context.config().library.last_entity_kind);
            connect(&context, &queue)?;
            let entities = load_listing(&context, &queue, kind)?;
            context.set_last_entity_kind(kind);
            for entity in &entities {
                match entity.as_album() {
                    Some(album) => print_albums(std::slice::from_ref(album)),
                    None => println!("{}", entity.name()),
                }
            }
        }
        Commands::Albums {
            artist,
            album_artist,
            genre,
        } => {
            connect(&context, &queue)?;
            let albums = match (artist, genre) {
                (Some(artist), _) => wait_for(&queue, |done| {
                    context.bridge.albums_for_artist(&artist, album_artist, done)
                })?,
                (None, Some(genre)) => {
                    wait_for(&queue, |done| context.bridge.albums_for_genre(&genre, done))?
                }
                (None, None) => return Err("pass --artist or --genre".into()),
            };
            print_albums(&albums);
        }
        Commands::Tracks { album } => {
            connect(&context, &queue)?;
            let album = find_album(&context, &queue, &album)?;
            let tracks = wait_for(&queue, |done| context.bridge.tracks_for_album(&album, done))?;
            println!("{album}");
            for track in tracks {
                println!(
                    "{:>2}. {}  {}",
                    track.track_number,
                    track.title,
                    format_duration(track.duration_secs)
                );
            }
        }
        Commands::Playlist { name, play } => {
            connect(&context, &queue)?;
            let tracks = wait_for(&queue, |done| context.bridge.tracks_for_playlist(&name, done))?;
            for track in &tracks {
                println!("{}  {}", track.title, track.artist);
            }
            if play {
                wait_for(&queue, |done| {
                    context
                        .bridge
                        .play_playlist(&name, PlayOptions::default(), Some(done))
                })?;
                println!("Playing {name}");
            }
        }
        Commands::Search { query, kind } => {
            connect(&context, &queue)?;
            let kinds: Vec<EntityKind> = match kind {
                Some(kind) => vec![kind],
                None => EntityKind::ALL.to_vec(),
            };
            for kind in &kinds {
                load_listing(&context, &queue, *kind)?;
            }
            let options = context.search_options();
            let results = match kind {
                Some(kind) => context.bridge.search_kind(kind, &query, options),
                None => context.bridge.search(&query, options),
            };
            for entity in results {
                println!("{:<8} {}", entity_label(&entity), entity.name());
            }
        }
        Commands::Covers { query } => {
            connect(&context, &queue)?;
            let albums: Vec<Album> = load_listing(&context, &queue, EntityKind::Albums)?
                .iter()
                .filter_map(MusicalEntity::as_album)
                .filter(|album| match &query {
                    Some(query) => album.name.to_lowercase().contains(&query.to_lowercase()),
                    None => true,
                })
                .cloned()
                .collect();
            let handles: Vec<_> = albums
                .iter()
                .map(|album| context.fetch_cover(album))
                .collect();
            queue.run_until(REQUEST_TIMEOUT, || {
                handles.iter().all(|handle| handle.state().is_terminal())
            });
            let (mut cached, mut failed) = (0usize, 0usize);
            for (album, handle) in albums.iter().zip(&handles) {
                match handle.outcome() {
                    Some(CoverOutcome::Success(_)) => cached += 1,
                    Some(CoverOutcome::Failed(err)) => {
                        failed += 1;
                        warn!("No cover for {}: {}", album, err);
                    }
                    Some(CoverOutcome::Cancelled) | None => handle.cancel(),
                }
            }
            println!(
                "{cached} cover(s) cached in {}, {failed} failed",
                context.covers.cache_root().display()
            );
        }
        Commands::Play {
            album,
            shuffle,
            repeat,
        } => {
            connect(&context, &queue)?;
            let album = find_album(&context, &queue, &album)?;
            wait_for(&queue, |done| {
                context
                    .bridge
                    .play_album(&album, PlayOptions { shuffle, repeat }, Some(done))
            })?;
            println!("Playing {album}");
        }
        Commands::Queue { album } => {
            connect(&context, &queue)?;
            let album = find_album(&context, &queue, &album)?;
            wait_for(&queue, |done| context.bridge.queue_album(&album, Some(done)))?;
            println!("Queued {album}");
        }
        Commands::PlayAll {
            artist,
            album_artist,
            genre,
            shuffle,
            repeat,
        } => {
            connect(&context, &queue)?;
            let options = PlayOptions { shuffle, repeat };
            match (artist, genre) {
                (Some(artist), _) => {
                    wait_for(&queue, |done| {
                        context
                            .bridge
                            .play_artist_albums(&artist, album_artist, options, Some(done))
                    })?;
                    println!("Playing every album by {artist}");
                }
                (None, Some(genre)) => {
                    wait_for(&queue, |done| {
                        context.bridge.play_genre_albums(&genre, options, Some(done))
                    })?;
                    println!("Playing every {genre} album");
                }
                (None, None) => return Err("pass --artist or --genre".into()),
            }
        }
        Commands::Random => {
            connect(&context, &queue)?;
            let picked = wait_for(&queue, |done| {
                context.play_random_album(PlayOptions::default(), done)
            })?;
            match picked {
                Some(album) => println!("Playing {album}"),
                None => println!("The library has no albums"),
            }
        }
        Commands::Playlists { action } => {
            connect(&context, &queue)?;
            let playlists = match &action {
                PlaylistAction::Create { name } => {
                    wait_for(&queue, |done| context.bridge.create_playlist(name, done))?
                }
                PlaylistAction::Rename { name, new_name } => wait_for(&queue, |done| {
                    context.bridge.rename_playlist(name, new_name, done)
                })?,
                PlaylistAction::Delete { name } => {
                    wait_for(&queue, |done| context.bridge.delete_playlist(name, done))?
                }
            };
            for playlist in &playlists {
                println!("{}", playlist.name());
            }
        }
        Commands::Control { action } => {
            wait_for(&queue, |done| {
                context.bridge.player_command(action.into(), Some(done))
            })?;
        }
        Commands::Status => {
            let status = wait_for(&queue, |done| context.bridge.player_status(done))?;
            println!("state: {:?}", status.state);
            match status.volume {
                Some(volume) => println!("volume: {volume}%"),
                None => println!("volume: n/a"),
            }
            if let (Some(position), Some(elapsed)) = (status.song_position, status.elapsed_secs) {
                println!(
                    "song: {}/{} at {}",
                    position + 1,
                    status.queue_length,
                    format_duration(elapsed as u32)
                );
            }
            println!("random: {}  repeat: {}", status.random, status.repeat);
        }
        Commands::Password { .. } => {}
    }

    Ok(())
}
