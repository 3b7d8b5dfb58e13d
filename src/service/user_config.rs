//! Per-user gateway configuration files
//!
//! `UpdateUserRoutes` hands the requested routes and DNS servers to a
//! [`UserConfigWriter`]. The shipped writer renders the ocserv per-user format
//! (`route = ...`, `dns = ...`) into `<dir>/<username>`, keeping the previous
//! file as `<username>.bak`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Why a per-user configuration could not be written
#[derive(Debug, Error)]
pub enum UserConfigError {
    /// A route, DNS server, or directive was rejected
    #[error("invalid {field}: {value:?}")]
    Invalid {
        /// Which kind of entry was rejected
        field: &'static str,
        /// The offending value
        value: String,
    },

    /// The file could not be written
    #[error("failed to write {}: {source}", path.display())]
    Io {
        /// File being written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Requested per-user network settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRouteUpdate {
    /// User the file is for
    pub username: String,
    /// Routes pushed to the client; `default` routes everything
    pub routes: Vec<String>,
    /// DNS servers pushed to the client
    pub dns_servers: Vec<String>,
    /// Extra `key = value` directives
    pub directives: BTreeMap<String, String>,
}

/// Writes a user's gateway configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserConfigWriter: Send + Sync {
    /// Render `update` and store it at `path`
    async fn write_user_config(
        &self,
        path: &Path,
        update: &UserRouteUpdate,
    ) -> Result<(), UserConfigError>;
}

/// Writer for the ocserv `config-per-user` format
#[derive(Debug, Clone, Copy, Default)]
pub struct OcservUserConfigWriter;

#[async_trait]
impl UserConfigWriter for OcservUserConfigWriter {
    async fn write_user_config(
        &self,
        path: &Path,
        update: &UserRouteUpdate,
    ) -> Result<(), UserConfigError> {
        let content = render(update)?;
        let io_err = |source| UserConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if tokio::fs::try_exists(path).await.map_err(io_err)? {
            tokio::fs::copy(path, with_suffix(path, ".bak"))
                .await
                .map_err(io_err)?;
        }

        // Write next to the target and rename so the gateway never reads a partial file
        let staging = with_suffix(path, ".tmp");
        tokio::fs::write(&staging, content).await.map_err(io_err)?;
        tokio::fs::rename(&staging, path).await.map_err(io_err)?;
        Ok(())
    }
}

/// Render the file body, validating every entry
pub fn render(update: &UserRouteUpdate) -> Result<String, UserConfigError> {
    let mut out = String::new();
    let _ = writeln!(out, "# Generated by warden for {}", update.username);

    for route in &update.routes {
        let route = route.trim();
        validate_route(route)?;
        let _ = writeln!(out, "route = {}", route);
    }

    for dns in &update.dns_servers {
        let dns = dns.trim();
        if dns.parse::<IpAddr>().is_err() {
            return Err(invalid("DNS server", dns));
        }
        let _ = writeln!(out, "dns = {}", dns);
    }

    for (key, value) in &update.directives {
        let key_ok = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !key_ok {
            return Err(invalid("directive name", key));
        }
        if value.chars().any(char::is_control) {
            return Err(invalid("directive value", value));
        }
        let _ = writeln!(out, "{} = {}", key, value);
    }

    Ok(out)
}

/// Accepts `default`, a bare address, `addr/prefix`, or `ipv4/netmask`
fn validate_route(route: &str) -> Result<(), UserConfigError> {
    if route == "default" {
        return Ok(());
    }

    let valid = match route.split_once('/') {
        None => route.parse::<IpAddr>().is_ok(),
        Some((addr, mask)) => match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => {
                mask.parse::<u8>().is_ok_and(|p| p <= 32) || mask.parse::<Ipv4Addr>().is_ok()
            }
            Ok(IpAddr::V6(_)) => mask.parse::<u8>().is_ok_and(|p| p <= 128),
            Err(_) => false,
        },
    };

    if valid {
        Ok(())
    } else {
        Err(invalid("route", route))
    }
}

/// `path` with `suffix` appended to the file name; usernames may contain dots
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn invalid(field: &'static str, value: &str) -> UserConfigError {
    UserConfigError::Invalid {
        field,
        value: value.to_string(),
    }
}
