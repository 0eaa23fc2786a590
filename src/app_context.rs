//! Wiring between configuration, the server registry, the library bridge and
//! the cover cache.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::warn;
use tokio::sync::broadcast;

use crate::backends::{MusicServerAdapter, PlayOptions};
use crate::config::Config;
use crate::config_persistence::persist_config_file;
use crate::cover_cache::{CoverArtCache, CoverHandle};
use crate::cover_transport::CoverTransport;
use crate::discovery::ServerExplorer;
use crate::entity_bridge::{BridgeOptions, Completion, EntityBridge};
use crate::error::LibraryError;
use crate::foreground::ForegroundHandle;
use crate::model::{Album, EntityKind};
use crate::protocol::{Message, ServerMessage};
use crate::search::SearchOptions;
use crate::server_registry::{Server, ServerRegistry};
use crate::worker_pool::{lock_or_recover, WorkerPool};

const LIBRARY_WORKERS: usize = 2;

/// Password lookup for a configured endpoint.
pub type PasswordLookup<'a> = &'a dyn Fn(&str, u16) -> Option<String>;

/// Application services shared by every command.
pub struct AppContext {
    pub bus_sender: broadcast::Sender<Message>,
    pub registry: Arc<Mutex<ServerRegistry>>,
    pub bridge: EntityBridge,
    pub covers: CoverArtCache,
    config_state: Arc<Mutex<Config>>,
    config_file: Option<PathBuf>,
    explorer: Mutex<ServerExplorer>,
}

impl AppContext {
    pub fn new(
        config: Config,
        config_file: Option<PathBuf>,
        adapter: Arc<dyn MusicServerAdapter>,
        transport: Arc<dyn CoverTransport>,
        foreground: ForegroundHandle,
        passwords: PasswordLookup<'_>,
    ) -> Result<Self, String> {
        let cache_root = config
            .covers
            .resolved_cache_dir()
            .ok_or_else(|| "no cache directory available for cover art".to_string())?;
        let (bus_sender, _) = broadcast::channel(1024);

        let configured: Vec<Server> = config
            .servers
            .iter()
            .map(|server| server.to_server(passwords(&server.hostname, server.port)))
            .collect();
        let initially_active = config
            .servers
            .iter()
            .zip(configured.iter())
            .find(|(server_config, _)| server_config.active)
            .map(|(_, server)| server.clone());
        let registry = Arc::new(Mutex::new(ServerRegistry::new(configured)));

        let bridge = EntityBridge::new(
            adapter,
            WorkerPool::new("library", LIBRARY_WORKERS),
            foreground.clone(),
            bus_sender.clone(),
            BridgeOptions {
                prefetch_albums_on_connect: config.library.prefetch_albums_on_connect,
            },
        );
        let covers = CoverArtCache::new(
            cache_root,
            config.covers.max_cover_bytes(),
            transport,
            WorkerPool::new("covers", config.covers.download_workers as usize),
            foreground.clone(),
            bus_sender.clone(),
        );
        let cover_url_template = Some(config.discovery.cover_url_template.clone())
            .filter(|template| !template.trim().is_empty());
        let explorer = ServerExplorer::new(
            &config.discovery.service_type,
            cover_url_template,
            Arc::clone(&registry),
            foreground,
            bus_sender.clone(),
        );

        let context = Self {
            bus_sender,
            registry,
            bridge,
            covers,
            config_state: Arc::new(Mutex::new(config)),
            config_file,
            explorer: Mutex::new(explorer),
        };
        if let Some(server) = initially_active {
            lock_or_recover(&context.registry).set_active(Some(server.clone()));
            context.bridge.set_server(Some(server));
        }
        Ok(context)
    }

    pub fn config(&self) -> Config {
        lock_or_recover(&self.config_state).clone()
    }

    pub fn active_server(&self) -> Option<Server> {
        lock_or_recover(&self.registry).active_server()
    }

    pub fn search_options(&self) -> SearchOptions {
        let config = lock_or_recover(&self.config_state);
        SearchOptions {
            diacritic_sensitive: config.library.search_diacritic_sensitive,
            case_sensitive: config.library.search_case_sensitive,
        }
    }

    fn update_config<F>(&self, update: F)
    where
        F: FnOnce(&mut Config),
    {
        let snapshot = {
            let mut config = lock_or_recover(&self.config_state);
            update(&mut config);
            config.clone()
        };
        if let Some(path) = &self.config_file {
            persist_config_file(&snapshot, path);
        }
    }

    /// Makes `server` the active one.
    ///
    /// The library graph is dropped, pending library requests and cover
    /// downloads are cancelled, and the choice is saved when the server is a
    /// configured one.
    pub fn set_active_server(&self, server: Option<Server>) {
        lock_or_recover(&self.registry).set_active(server.clone());
        self.bridge.set_server(server.clone());
        self.covers.cancel_all();
        self.update_config(|config| {
            for entry in &mut config.servers {
                entry.active = server.as_ref().is_some_and(|active| {
                    active.port == entry.port
                        && active.hostname.eq_ignore_ascii_case(&entry.hostname)
                });
            }
        });
        let _ = self
            .bus_sender
            .send(Message::Server(ServerMessage::ActiveServerChanged {
                name: server.map(|server| server.name),
            }));
    }

    /// Activates the known server called `name`.
    pub fn select_server(&self, name: &str) -> Result<Server, String> {
        let server = lock_or_recover(&self.registry)
            .find_by_name(name)
            .ok_or_else(|| format!("no server named '{name}'"))?;
        self.set_active_server(Some(server.clone()));
        Ok(server)
    }

    pub fn set_last_entity_kind(&self, kind: EntityKind) {
        self.update_config(|config| config.library.last_entity_kind = kind);
    }

    /// Cover for `album` from the active server.
    pub fn fetch_cover(&self, album: &Album) -> CoverHandle {
        let server = self.active_server();
        self.covers.fetch_cover(album, server.as_ref())
    }

    /// Plays a random album from the active server's library.
    pub fn play_random_album(&self, options: PlayOptions, completion: Completion<Option<Album>>) {
        if !lock_or_recover(&self.config_state).library.random_album_enabled {
            warn!("AppContext: random album playback is disabled in the configuration");
            completion(Err(LibraryError::RandomAlbumDisabled));
            return;
        }
        self.bridge.play_random_album(options, completion);
    }

    pub fn start_discovery(&self) -> Result<(), String> {
        if !lock_or_recover(&self.config_state).discovery.enabled {
            warn!("AppContext: discovery is disabled in the configuration");
            return Err("discovery is disabled".to_string());
        }
        lock_or_recover(&self.explorer).start()
    }

    pub fn stop_discovery(&self) {
        lock_or_recover(&self.explorer).stop();
    }

    pub fn discovery_running(&self) -> bool {
        lock_or_recover(&self.explorer).is_running()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, ErrorKind, Read};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use super::AppContext;
    use crate::backends::{MusicServerAdapter, PlayOptions, PlayerCommand, PlayerStatus};
    use crate::config::{Config, CoverSourceConfig, ServerConfig};
    use crate::config_persistence::load_config_file;
    use crate::cover_cache::CoverOutcome;
    use crate::cover_transport::{CoverBody, CoverTransport};
    use crate::error::LibraryError;
    use crate::foreground::ForegroundQueue;
    use crate::model::{Album, EntityKind, Track};
    use crate::protocol::{Message, ServerMessage};
    use crate::server_registry::Server;

    struct EmptyAdapter;

    impl MusicServerAdapter for EmptyAdapter {
        fn ping(&self, _server: &Server) -> Result<(), LibraryError> {
            Ok(())
        }
        fn fetch_albums(&self, _server: &Server) -> Result<Vec<Album>, LibraryError> {
            Ok(Vec::new())
        }
        fn fetch_names(
            &self,
            _server: &Server,
            _kind: EntityKind,
        ) -> Result<Vec<String>, LibraryError> {
            Ok(Vec::new())
        }
        fn fetch_albums_for_artist(
            &self,
            _server: &Server,
            _artist: &str,
            _album_artist: bool,
        ) -> Result<Vec<Album>, LibraryError> {
            Ok(Vec::new())
        }
        fn fetch_albums_for_genre(
            &self,
            _server: &Server,
            _genre: &str,
        ) -> Result<Vec<Album>, LibraryError> {
            Ok(Vec::new())
        }
        fn fetch_album_tracks(
            &self,
            _server: &Server,
            _album: &Album,
        ) -> Result<Vec<Track>, LibraryError> {
            Ok(Vec::new())
        }
        fn fetch_playlist_tracks(
            &self,
            _server: &Server,
            _playlist: &str,
        ) -> Result<Vec<Track>, LibraryError> {
            Ok(Vec::new())
        }
        fn play_album(
            &self,
            _server: &Server,
            _album: &Album,
            _options: PlayOptions,
        ) -> Result<(), LibraryError> {
            Ok(())
        }
        fn play_tracks(
            &self,
            _server: &Server,
            _tracks: &[Track],
            _options: PlayOptions,
        ) -> Result<(), LibraryError> {
            Ok(())
        }
        fn play_playlist(
            &self,
            _server: &Server,
            _playlist: &str,
            _options: PlayOptions,
        ) -> Result<(), LibraryError> {
            Ok(())
        }
        fn queue_album(&self, _server: &Server, _album: &Album) -> Result<(), LibraryError> {
            Ok(())
        }
        fn save_playlist(&self, _server: &Server, _name: &str) -> Result<(), LibraryError> {
            Ok(())
        }
        fn rename_playlist(
            &self,
            _server: &Server,
            _name: &str,
            _new_name: &str,
        ) -> Result<(), LibraryError> {
            Ok(())
        }
        fn delete_playlist(&self, _server: &Server, _name: &str) -> Result<(), LibraryError> {
            Ok(())
        }
        fn send_command(
            &self,
            _server: &Server,
            _command: PlayerCommand,
        ) -> Result<(), LibraryError> {
            Ok(())
        }
        fn fetch_status(&self, _server: &Server) -> Result<PlayerStatus, LibraryError> {
            Ok(PlayerStatus::default())
        }
    }

    struct RefusingTransport;

    impl CoverTransport for RefusingTransport {
        fn open(&self, _url: &str) -> Result<CoverBody, LibraryError> {
            Err(LibraryError::Transport("offline".to_string()))
        }
    }

    type Release = Arc<(Mutex<bool>, Condvar)>;

    /// Body that never delivers a byte until its transfer is shut down.
    struct StalledBody {
        release: Release,
    }

    impl Read for StalledBody {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let (lock, changed) = &*self.release;
            let guard = lock.lock().expect("release lock");
            let (released, _) = changed
                .wait_timeout_while(guard, Duration::from_secs(10), |released| !*released)
                .expect("release wait");
            if *released {
                Err(io::Error::new(ErrorKind::ConnectionAborted, "shut down"))
            } else {
                Err(io::Error::new(ErrorKind::TimedOut, "stalled"))
            }
        }
    }

    #[derive(Default)]
    struct StalledTransport {
        opened: AtomicUsize,
    }

    impl CoverTransport for StalledTransport {
        fn open(&self, _url: &str) -> Result<CoverBody, LibraryError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let release: Release = Arc::new((Mutex::new(false), Condvar::new()));
            let shutdown = Arc::clone(&release);
            Ok(
                CoverBody::new(Box::new(StalledBody { release })).with_shutdown(move || {
                    let (lock, changed) = &*shutdown;
                    *lock.lock().expect("release lock") = true;
                    changed.notify_all();
                }),
            )
        }
    }

    fn eventually<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()))
    }

    fn server_config(name: &str, hostname: &str, active: bool) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            hostname: hostname.to_string(),
            port: 6600,
            active,
            covers: None,
        }
    }

    fn build_context(dir: &PathBuf, config: Config, queue: &ForegroundQueue) -> AppContext {
        build_context_with(dir, config, queue, Arc::new(RefusingTransport))
    }

    fn build_context_with(
        dir: &PathBuf,
        config: Config,
        queue: &ForegroundQueue,
        transport: Arc<dyn CoverTransport>,
    ) -> AppContext {
        let mut config = config;
        config.covers.cache_dir = dir.join("covers").display().to_string();
        AppContext::new(
            config,
            Some(dir.join("config.toml")),
            Arc::new(EmptyAdapter),
            transport,
            queue.handle(),
            &|hostname: &str, _port: u16| (hostname == "den.local").then(|| "secret".to_string()),
        )
        .expect("context should build")
    }

    #[test]
    fn test_configured_active_server_is_selected_with_password() {
        let dir = unique_temp_dir("mpdshelf-context");
        let queue = ForegroundQueue::new();
        let mut config = Config::default();
        config.servers = vec![
            server_config("Office", "office.local", false),
            server_config("Den", "den.local", true),
        ];

        let context = build_context(&dir, config, &queue);
        let active = context.active_server().expect("active server should be set");
        assert_eq!(active.name, "Den");
        assert_eq!(active.password.as_deref(), Some("secret"));
        assert_eq!(context.bridge.server(), Some(active));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_select_server_switches_publishes_and_persists() {
        let dir = unique_temp_dir("mpdshelf-context-select");
        std::fs::create_dir_all(&dir).expect("temp dir should be created");
        let queue = ForegroundQueue::new();
        let mut config = Config::default();
        config.servers = vec![
            server_config("Office", "office.local", false),
            server_config("Den", "den.local", true),
        ];

        let context = build_context(&dir, config, &queue);
        let mut bus = context.bus_sender.subscribe();
        let selected = context.select_server("Office").expect("server should exist");
        assert_eq!(selected.hostname, "office.local");
        assert_eq!(
            context.bridge.server().map(|server| server.name),
            Some("Office".to_string())
        );

        let mut announced = None;
        while let Ok(message) = bus.try_recv() {
            if let Message::Server(ServerMessage::ActiveServerChanged { name }) = message {
                announced = name;
            }
        }
        assert_eq!(announced.as_deref(), Some("Office"));

        let persisted = load_config_file(&dir.join("config.toml"));
        assert!(persisted.servers[0].active);
        assert!(!persisted.servers[1].active);

        assert!(context.select_server("Attic").is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_cover_without_active_server_fails_and_leaves_nothing_in_flight() {
        let dir = unique_temp_dir("mpdshelf-context-covers");
        let queue = ForegroundQueue::new();
        let context = build_context(&dir, Config::default(), &queue);

        let album = Album::with_details("Gold", "Abba/Gold", "Abba", "Pop", "1992");
        let handle = context.fetch_cover(&album);
        let outcome = handle.wait(Duration::from_secs(5));
        assert!(matches!(
            outcome,
            Some(CoverOutcome::Failed(LibraryError::NoServerConfigured))
        ));

        context.set_active_server(None);
        assert_eq!(context.covers.in_flight_count(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_last_entity_kind_is_persisted() {
        let dir = unique_temp_dir("mpdshelf-context-kind");
        std::fs::create_dir_all(&dir).expect("temp dir should be created");
        let queue = ForegroundQueue::new();
        let context = build_context(&dir, Config::default(), &queue);

        context.set_last_entity_kind(EntityKind::Genres);
        assert_eq!(context.config().library.last_entity_kind, EntityKind::Genres);
        assert_eq!(
            load_config_file(&dir.join("config.toml")).library.last_entity_kind,
            EntityKind::Genres
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_disabled_discovery_refuses_to_start() {
        let dir = unique_temp_dir("mpdshelf-context-discovery");
        let queue = ForegroundQueue::new();
        let mut config = Config::default();
        config.discovery.enabled = false;
        let context = build_context(&dir, config, &queue);

        assert!(context.start_discovery().is_err());
        assert!(!context.discovery_running());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_server_switch_cancels_cover_download_in_progress() {
        let dir = unique_temp_dir("mpdshelf-context-switch");
        let queue = ForegroundQueue::new();
        let mut config = Config::default();
        let mut den = server_config("Den", "den.local", true);
        den.covers = Some(CoverSourceConfig::HttpDirectory {
            base_url: "http://den.local/music".to_string(),
            file_name: "cover.jpg".to_string(),
        });
        config.servers = vec![server_config("Office", "office.local", false), den];
        let transport = Arc::new(StalledTransport::default());
        let context = build_context_with(&dir, config, &queue, transport.clone());

        let album = Album::with_details("Gold", "Abba/Gold", "Abba", "Pop", "1992");
        let handle = context.fetch_cover(&album);
        assert!(eventually(|| transport.opened.load(Ordering::SeqCst) == 1));
        assert_eq!(context.covers.in_flight_count(), 1);

        context.select_server("Office").expect("server should exist");
        assert_eq!(
            handle.wait(Duration::from_secs(5)),
            Some(CoverOutcome::Cancelled)
        );
        assert!(eventually(|| context.covers.in_flight_count() == 0));
        assert!(!context.covers.local_cover_path(&album).exists());
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_random_album_respects_configuration() {
        let dir = unique_temp_dir("mpdshelf-context-random");
        let queue = ForegroundQueue::new();
        let mut config = Config::default();
        config.library.random_album_enabled = false;
        config.servers = vec![server_config("Den", "den.local", true)];
        let context = build_context(&dir, config, &queue);

        let outcome = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&outcome);
        context.play_random_album(
            PlayOptions::default(),
            Box::new(move |result| *writer.lock().expect("outcome lock") = Some(result)),
        );
        assert_eq!(
            outcome.lock().expect("outcome lock").take(),
            Some(Err(LibraryError::RandomAlbumDisabled))
        );
        let _ = std::fs::remove_dir_all(dir);
    }
}
