//! Keyring helpers for server passwords.

use keyring::Entry;

const SERVER_SERVICE_NAME: &str = "mpdshelf.server";

fn account_for(hostname: &str, port: u16) -> String {
    format!("{}:{port}", hostname.to_ascii_lowercase())
}

fn server_entry(hostname: &str, port: u16) -> Result<Entry, String> {
    Entry::new(SERVER_SERVICE_NAME, &account_for(hostname, port))
        .map_err(|err| format!("failed to create keyring entry: {err}"))
}

/// Saves the password for a server endpoint into the OS keyring.
pub fn set_server_password(hostname: &str, port: u16, password: &str) -> Result<(), String> {
    let entry = server_entry(hostname, port)?;
    entry
        .set_password(password)
        .map_err(|err| format!("failed to set keyring password: {err}"))
}

/// Loads the password for a server endpoint from the OS keyring.
pub fn get_server_password(hostname: &str, port: u16) -> Result<Option<String>, String> {
    let entry = server_entry(hostname, port)?;
    match entry.get_password() {
        Ok(password) => Ok(Some(password)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(format!("failed to get keyring password: {err}")),
    }
}

/// Deletes the password for a server endpoint from the OS keyring.
pub fn delete_server_password(hostname: &str, port: u16) -> Result<(), String> {
    let entry = server_entry(hostname, port)?;
    match entry.delete_password() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(err) => Err(format!("failed to delete keyring password: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::account_for;

    #[test]
    fn test_account_is_case_insensitive_on_host() {
        assert_eq!(account_for("NAS.Local", 6600), "nas.local:6600");
    }
}
