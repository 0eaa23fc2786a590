use std::path::Path;

use log::{info, warn};
use toml_edit::{value, ArrayOfTables, DocumentMut, InlineTable, Item, Table};

use crate::config::{sanitize_config, Config, CoverSourceConfig, ServerConfig};
use crate::cover_transport::TrustPolicy;

fn set_table_value_preserving_decor(table: &mut Table, key: &str, item: Item) {
    let replacing_scalar_with_aot = item.is_array_of_tables()
        && table
            .get(key)
            .is_some_and(|current| !current.is_array_of_tables());
    if replacing_scalar_with_aot {
        table.remove(key);
        table[key] = item;
        return;
    }

    let existing_value_decor = table
        .get(key)
        .and_then(|current| current.as_value().map(|value| value.decor().clone()));
    table[key] = item;
    if let Some(existing_value_decor) = existing_value_decor {
        if let Some(next_value) = table[key].as_value_mut() {
            *next_value.decor_mut() = existing_value_decor;
        }
    }
}

fn set_table_scalar_if_changed<T, F>(
    table: &mut Table,
    key: &str,
    previous_value: T,
    next_value: T,
    to_item: F,
) where
    T: PartialEq + Copy,
    F: FnOnce(T) -> Item,
{
    if table.contains_key(key) && previous_value == next_value {
        return;
    }
    set_table_value_preserving_decor(table, key, to_item(next_value));
}

fn set_table_string_if_changed(
    table: &mut Table,
    key: &str,
    previous_value: &str,
    next_value: &str,
) {
    if table.contains_key(key) && previous_value == next_value {
        return;
    }
    set_table_value_preserving_decor(table, key, value(next_value));
}

fn ensure_section_table<'a>(document: &'a mut DocumentMut, key: &str) -> Option<&'a mut Table> {
    let root = document.as_table_mut();
    let should_replace = !matches!(root.get(key), Some(item) if item.is_table());
    if should_replace {
        root.insert(key, Item::Table(Table::new()));
    }
    root.get_mut(key).and_then(Item::as_table_mut)
}

fn trust_policy_str(policy: TrustPolicy) -> &'static str {
    match policy {
        TrustPolicy::SystemRoots => "system_roots",
        TrustPolicy::AcceptAnyCertificate => "accept_any_certificate",
    }
}

fn cover_source_table(covers: &CoverSourceConfig) -> InlineTable {
    let mut table = InlineTable::new();
    match covers {
        CoverSourceConfig::HttpDirectory {
            base_url,
            file_name,
        } => {
            table.insert("kind", "http_directory".into());
            table.insert("base_url", base_url.as_str().into());
            table.insert("file_name", file_name.as_str().into());
        }
        CoverSourceConfig::QueryEndpoint {
            endpoint,
            parameter,
        } => {
            table.insert("kind", "query_endpoint".into());
            table.insert("endpoint", endpoint.as_str().into());
            table.insert("parameter", parameter.as_str().into());
        }
    }
    table
}

fn server_row(server: &ServerConfig) -> Table {
    let mut row = Table::new();
    row.insert("name", value(server.name.clone()));
    row.insert("hostname", value(server.hostname.clone()));
    row.insert("port", value(i64::from(server.port)));
    row.insert("active", value(server.active));
    if let Some(covers) = &server.covers {
        row.insert("covers", value(cover_source_table(covers)));
    }
    row
}

fn write_config_to_document(document: &mut DocumentMut, previous: &Config, config: &Config) {
    if let Some(library) = ensure_section_table(document, "library") {
        set_table_scalar_if_changed(
            library,
            "last_entity_kind",
            previous.library.last_entity_kind,
            config.library.last_entity_kind,
            |kind| value(kind.as_str()),
        );
        set_table_scalar_if_changed(
            library,
            "prefetch_albums_on_connect",
            previous.library.prefetch_albums_on_connect,
            config.library.prefetch_albums_on_connect,
            value,
        );
        set_table_scalar_if_changed(
            library,
            "search_diacritic_sensitive",
            previous.library.search_diacritic_sensitive,
            config.library.search_diacritic_sensitive,
            value,
        );
        set_table_scalar_if_changed(
            library,
            "search_case_sensitive",
            previous.library.search_case_sensitive,
            config.library.search_case_sensitive,
            value,
        );
        set_table_scalar_if_changed(
            library,
            "random_album_enabled",
            previous.library.random_album_enabled,
            config.library.random_album_enabled,
            value,
        );
    }

    if let Some(connection) = ensure_section_table(document, "connection") {
        set_table_scalar_if_changed(
            connection,
            "connect_timeout_secs",
            previous.connection.connect_timeout_secs,
            config.connection.connect_timeout_secs,
            |secs| value(i64::try_from(secs).unwrap_or(i64::MAX)),
        );
        set_table_scalar_if_changed(
            connection,
            "io_timeout_secs",
            previous.connection.io_timeout_secs,
            config.connection.io_timeout_secs,
            |secs| value(i64::try_from(secs).unwrap_or(i64::MAX)),
        );
    }

    if let Some(covers) = ensure_section_table(document, "covers") {
        set_table_string_if_changed(
            covers,
            "cache_dir",
            &previous.covers.cache_dir,
            &config.covers.cache_dir,
        );
        set_table_scalar_if_changed(
            covers,
            "download_workers",
            i64::from(previous.covers.download_workers),
            i64::from(config.covers.download_workers),
            value,
        );
        set_table_scalar_if_changed(
            covers,
            "transfer_timeout_secs",
            previous.covers.transfer_timeout_secs,
            config.covers.transfer_timeout_secs,
            |secs| value(i64::try_from(secs).unwrap_or(i64::MAX)),
        );
        set_table_scalar_if_changed(
            covers,
            "max_cover_size_mb",
            i64::from(previous.covers.max_cover_size_mb),
            i64::from(config.covers.max_cover_size_mb),
            value,
        );
        set_table_scalar_if_changed(
            covers,
            "trust_policy",
            previous.covers.trust_policy,
            config.covers.trust_policy,
            |policy| value(trust_policy_str(policy)),
        );
    }

    if let Some(discovery) = ensure_section_table(document, "discovery") {
        set_table_scalar_if_changed(
            discovery,
            "enabled",
            previous.discovery.enabled,
            config.discovery.enabled,
            value,
        );
        set_table_string_if_changed(
            discovery,
            "service_type",
            &previous.discovery.service_type,
            &config.discovery.service_type,
        );
        set_table_string_if_changed(
            discovery,
            "cover_url_template",
            &previous.discovery.cover_url_template,
            &config.discovery.cover_url_template,
        );
    }

    let root = document.as_table_mut();
    if config.servers.is_empty() {
        root.remove("servers");
    } else if !root.contains_key("servers") || previous.servers != config.servers {
        let mut servers = ArrayOfTables::new();
        for server in &config.servers {
            servers.push(server_row(server));
        }
        set_table_value_preserving_decor(root, "servers", Item::ArrayOfTables(servers));
    }
}

pub fn serialize_config_with_preserved_comments(
    existing_text: &str,
    config: &Config,
) -> Result<String, String> {
    let previous = toml::from_str::<Config>(existing_text)
        .map_err(|err| format!("failed to parse existing config as Config: {}", err))?;
    let mut document = existing_text
        .parse::<DocumentMut>()
        .map_err(|err| format!("failed to parse existing config as TOML document: {}", err))?;
    write_config_to_document(&mut document, &previous, config);
    Ok(document.to_string())
}

pub fn system_config_template_text() -> &'static str {
    include_str!("../config/config.system.toml")
}

/// Reads and sanitizes the config file, creating it from the system
/// template first when it does not exist.
pub fn load_config_file(path: &Path) -> Config {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    err
                );
            }
        }
        if let Err(err) = std::fs::write(path, system_config_template_text()) {
            warn!(
                "Failed to write default config to {}: {}",
                path.display(),
                err
            );
        }
    }

    let config = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<Config>(&content).unwrap_or_else(|err| {
            warn!(
                "Failed to parse config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            Config::default()
        }),
        Err(err) => {
            warn!(
                "Failed to read config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            Config::default()
        }
    };
    sanitize_config(config)
}

pub fn persist_config_file(config: &Config, path: &Path) {
    let existing_text = std::fs::read_to_string(path).ok();
    let config_text = if let Some(existing_text) = existing_text {
        match serialize_config_with_preserved_comments(&existing_text, config) {
            Ok(updated_text) => Some(updated_text),
            Err(err) => {
                warn!(
                    "Failed to preserve config comments for {} ({}). Falling back to plain serialization.",
                    path.display(),
                    err
                );
                toml::to_string(config).ok()
            }
        }
    } else {
        toml::to_string(config).ok()
    };

    let Some(config_text) = config_text else {
        log::error!("Failed to serialize config for {}", path.display());
        return;
    };

    if let Err(err) = std::fs::write(path, config_text) {
        log::error!("Failed to persist config to {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{
        load_config_file, persist_config_file, serialize_config_with_preserved_comments,
        system_config_template_text,
    };
    use crate::config::{Config, CoverSourceConfig, ServerConfig};
    use crate::cover_transport::TrustPolicy;
    use crate::model::EntityKind;

    fn unique_temp_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()))
    }

    #[test]
    fn test_serialize_preserves_comments_and_updates_changed_values() {
        let mut config = Config::default();
        config.library.last_entity_kind = EntityKind::Playlists;
        config.covers.trust_policy = TrustPolicy::AcceptAnyCertificate;

        let text = serialize_config_with_preserved_comments(system_config_template_text(), &config)
            .expect("template should serialize");
        assert!(text.contains("# Empty uses the per-user cache directory."));
        assert!(text.contains("last_entity_kind = \"playlists\""));
        assert!(text.contains("trust_policy = \"accept_any_certificate\""));

        let parsed: Config = toml::from_str(&text).expect("updated config should parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_serialize_creates_missing_sections() {
        let mut config = Config::default();
        config.library.search_case_sensitive = true;
        config.library.random_album_enabled = false;
        config.connection.io_timeout_secs = 42;

        let text = serialize_config_with_preserved_comments("# local overrides\n", &config)
            .expect("document should serialize");
        assert!(text.starts_with("# local overrides"));
        let parsed: Config = toml::from_str(&text).expect("rebuilt config should parse");
        assert!(parsed.library.search_case_sensitive);
        assert!(!parsed.library.random_album_enabled);
        assert_eq!(parsed.connection.io_timeout_secs, 42);
    }

    #[test]
    fn test_serialize_writes_and_removes_server_rows() {
        let mut config = Config::default();
        config.servers = vec![
            ServerConfig {
                name: "Den".to_string(),
                hostname: "den.local".to_string(),
                port: 6600,
                active: true,
                covers: Some(CoverSourceConfig::HttpDirectory {
                    base_url: "http://den.local/music".to_string(),
                    file_name: "folder.jpg".to_string(),
                }),
            },
            ServerConfig {
                name: "Office".to_string(),
                hostname: "office.local".to_string(),
                port: 6601,
                active: false,
                covers: None,
            },
        ];

        let text = serialize_config_with_preserved_comments(system_config_template_text(), &config)
            .expect("template should serialize");
        let parsed: Config = toml::from_str(&text).expect("updated config should parse");
        assert_eq!(parsed.servers, config.servers);

        let cleared = serialize_config_with_preserved_comments(&text, &Config::default())
            .expect("config should serialize");
        let parsed: Config = toml::from_str(&cleared).expect("cleared config should parse");
        assert!(parsed.servers.is_empty());
    }

    #[test]
    fn test_load_creates_missing_file_from_template() {
        let dir = unique_temp_path("mpdshelf-config");
        let path = dir.join("config.toml");

        let config = load_config_file(&path);
        assert_eq!(config, Config::default());
        let written = std::fs::read_to_string(&path).expect("config file should exist");
        assert_eq!(written, system_config_template_text());

        let mut updated = config.clone();
        updated.library.search_case_sensitive = true;
        persist_config_file(&updated, &path);
        assert_eq!(load_config_file(&path), updated);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_load_falls_back_to_defaults_for_invalid_toml() {
        let dir = unique_temp_path("mpdshelf-config-invalid");
        std::fs::create_dir_all(&dir).expect("temp dir should be created");
        let path = dir.join("config.toml");
        std::fs::write(&path, "[library\nbroken").expect("config should be written");

        assert_eq!(load_config_file(&path), Config::default());

        let _ = std::fs::remove_dir_all(dir);
    }
}
