//! Bearer-token source for analysis and model-inference triggers.
//!
//! Obtaining the token (Globus login, refresh) happens outside this crate.
//! The session only asks whether one is present.

/// Supplies an opaque bearer token, or `None` when the user has not logged in.
pub trait TokenProvider: Send + Sync {
    /// Current token, if any.
    fn token(&self) -> Option<String>;
}

/// A token fixed at construction time.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Provider that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// Provider with no token.
    pub fn absent() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone().filter(|t| !t.is_empty())
    }
}
