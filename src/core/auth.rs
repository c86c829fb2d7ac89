// src/core/auth.rs

//! The user-auth collaborator: resolves opaque user tokens to authorization
//! masks and reports join/leave/crash events for ranked users.
//!
//! The sequencer only sees the [`AuthResolver`] trait. The file-backed
//! implementation keeps a token cache persisted as lines of
//! `<auth_level> <token> <username>`; lines starting with `;` are comments.

use crate::core::client::AuthMask;
use dashmap::DashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Kind of user event reported to the auth backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEventKind {
    Join,
    Leave,
    Crash,
}

impl UserEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UserEventKind::Join => "join",
            UserEventKind::Leave => "leave",
            UserEventKind::Crash => "crash",
        }
    }
}

impl fmt::Display for UserEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves user tokens and emits user events. Failures inside an
/// implementation are its own problem; they must never surface to a session.
pub trait AuthResolver: Send + Sync {
    /// Maps a handshake token to an authorization mask and, when the backend
    /// knows the user, the registered nickname.
    fn resolve(&self, token: &str) -> (AuthMask, Option<String>);

    /// Reports a user event; kind is join, leave or crash.
    fn emit_event(&self, unique_id: &str, kind: UserEventKind, nickname: &str, vehicle: &str);
}

/// File-cache-backed resolver.
pub struct FileAuthResolver {
    path: Option<PathBuf>,
    /// username -> (token, auth level)
    cache: DashMap<String, (String, u32)>,
}

impl FileAuthResolver {
    /// Creates a resolver backed by the given cache file. A missing file is
    /// not an error; the cache simply starts empty.
    pub fn open(path: Option<&Path>) -> Self {
        let resolver = Self {
            path: path.map(|p| p.to_path_buf()),
            cache: DashMap::new(),
        };
        if let Some(path) = &resolver.path {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    resolver.load_lines(&contents);
                    info!(
                        "loaded {} auth cache entries from {}",
                        resolver.cache.len(),
                        path.display()
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not read auth cache {}: {e}", path.display()),
            }
        }
        resolver
    }

    fn load_lines(&self, contents: &str) {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let mut parts = line.splitn(3, char::is_whitespace);
            let (Some(level), Some(token), Some(username)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(level) = level.parse::<u32>() else {
                continue;
            };
            self.add_user(username.trim(), token, level);
        }
    }

    /// Inserts a user into the cache. `RANKED` and `BANNED` are not valid
    /// cached levels and are stripped.
    pub fn add_user(&self, username: &str, token: &str, auth_level: u32) {
        if username.is_empty() || token.is_empty() {
            return;
        }
        let mut mask = AuthMask(auth_level);
        mask.remove(AuthMask::RANKED);
        mask.remove(AuthMask::BANNED);
        self.cache
            .insert(username.to_string(), (token.to_string(), mask.0));
    }

    /// Removes a cache entry; not persisted until [`Self::save`] runs.
    pub fn remove_user(&self, username: &str) -> bool {
        self.cache.remove(username).is_some()
    }

    pub fn user_count(&self) -> usize {
        self.cache.len()
    }

    /// Rewrites the cache file in the persisted line format.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "; convoyd auth cache")?;
        for entry in self.cache.iter() {
            let (token, level) = entry.value();
            writeln!(file, "{level} {token} {}", entry.key())?;
        }
        file.flush()
    }
}

impl AuthResolver for FileAuthResolver {
    fn resolve(&self, token: &str) -> (AuthMask, Option<String>) {
        if token.is_empty() {
            return (AuthMask::NONE, None);
        }
        for entry in self.cache.iter() {
            let (cached_token, level) = entry.value();
            if cached_token == token {
                return (AuthMask(*level), Some(entry.key().clone()));
            }
        }
        (AuthMask::NONE, None)
    }

    fn emit_event(&self, unique_id: &str, kind: UserEventKind, nickname: &str, vehicle: &str) {
        // The cache-backed resolver has no event sink; the event is only
        // recorded in the log.
        info!(
            unique_id,
            nickname, vehicle, "user event: {kind}"
        );
    }
}
