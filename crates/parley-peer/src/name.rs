//! Display name source and process-lifetime cache.
//!
//! The name is asked for once (the first time a handshake needs it) and then
//! reused for every reconnect. A blank answer falls back to `Cliente<port>`.

use parley_core::fallback_name;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Supplies the user's chosen display name.
///
/// Called at most once per [`NameCache`]. May block (e.g. a terminal prompt);
/// it runs on the blocking thread pool.
pub trait NameSource: Send + Sync + 'static {
    /// Ask for a display name; `None` or blank selects the fallback
    fn request_name(&self) -> Option<String>;
}

impl<F> NameSource for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn request_name(&self) -> Option<String> {
        self()
    }
}

/// A name known up front
#[derive(Debug, Clone, Default)]
pub struct FixedName(Option<String>);

impl FixedName {
    /// Always answer with `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self(Some(name.into()))
    }

    /// Always answer blank, selecting the fallback name
    #[must_use]
    pub fn fallback() -> Self {
        Self(None)
    }
}

impl NameSource for FixedName {
    fn request_name(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Resolves the display name once and caches it
pub struct NameCache {
    source: Arc<dyn NameSource>,
    cached: OnceCell<String>,
}

impl NameCache {
    /// Wrap a name source
    pub fn new(source: Arc<dyn NameSource>) -> Self {
        Self {
            source,
            cached: OnceCell::new(),
        }
    }

    /// The cached name, asking the source on first use.
    ///
    /// `port` only matters for the fallback and only on the first call.
    pub async fn resolve(&self, port: u16) -> String {
        self.cached
            .get_or_init(|| async {
                let source = Arc::clone(&self.source);
                let answer = tokio::task::spawn_blocking(move || source.request_name())
                    .await
                    .ok()
                    .flatten();

                match answer.as_deref().map(str::trim) {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => fallback_name(port),
                }
            })
            .await
            .clone()
    }

    /// The name, if already resolved
    #[must_use]
    pub fn get(&self) -> Option<&str> {
        self.cached.get().map(String::as_str)
    }
}
