use std::{collections::HashMap, fmt::Display, fs, path::Path};

use tracing::info;

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The provided credentials are invalid.
    InvalidCredentials,
    /// The credential store could not be loaded.
    EngineError(String),
}

impl Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidCredentials => write!(f, "Invalid credentials"),
            AuthError::EngineError(msg) => write!(f, "Engine error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Credential check used by `AUTH LOGIN`.
pub trait AuthEngine: Send + Sync {
    /// Authenticates a user, `Err(InvalidCredentials)` on mismatch.
    fn authenticate(&self, username: &str, password: &str) -> AuthResult<()>;
}

/// In-memory credential store.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuthEngine {
    credentials: HashMap<String, String>,
}

impl MemoryAuthEngine {
    pub fn from_map(credentials: HashMap<String, String>) -> Self {
        Self { credentials }
    }

    /// Parses `username:password` lines, blank lines and `#` comments
    /// are skipped.
    ///
    /// ```
    /// use mailshield_utils::{AuthEngine, MemoryAuthEngine};
    ///
    /// let engine = MemoryAuthEngine::parse("# users\nalice:secret\n");
    /// assert!(engine.authenticate("alice", "secret").is_ok());
    /// ```
    pub fn parse(content: &str) -> Self {
        let credentials = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(user, pass)| (user.trim().to_string(), pass.trim().to_string()))
            .collect();
        Self { credentials }
    }

    /// Loads the credentials file.
    pub fn from_file(path: &Path) -> AuthResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| AuthError::EngineError(format!("{}: {e}", path.display())))?;
        let engine = Self::parse(&content);
        info!(path = %path.display(), users = engine.len(), "Loaded credentials");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl AuthEngine for MemoryAuthEngine {
    fn authenticate(&self, username: &str, password: &str) -> AuthResult<()> {
        match self.credentials.get(username) {
            Some(stored) if stored == password => Ok(()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}
