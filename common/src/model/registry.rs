//! Process-wide game id → slug registry.
//!
//! Populated by the category watcher (which sees slugs in directory
//! responses) and by on-demand `GameByID` lookups; read by the stream
//! updater when the stream-info query omits the slug. Initialized once,
//! never cleared.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

fn registry() -> &'static RwLock<HashMap<String, String>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Records a game id → slug mapping. Empty values are ignored.
pub fn register_game_slug(game_id: &str, slug: &str) {
    if game_id.is_empty() || slug.is_empty() {
        return;
    }
    registry()
        .write()
        .unwrap()
        .insert(game_id.to_owned(), slug.to_owned());
}

/// Returns the slug for a game id, if one has been registered.
pub fn lookup_game_slug(game_id: &str) -> Option<String> {
    registry().read().unwrap().get(game_id).cloned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_and_lookup() {
        register_game_slug("509658", "just-chatting");
        assert_eq!(
            lookup_game_slug("509658"),
            Some("just-chatting".to_owned())
        );
        assert_eq!(lookup_game_slug("no-such-game"), None);
    }

    #[test]
    fn empty_values_ignored() {
        register_game_slug("", "slug");
        register_game_slug("id-without-slug", "");
        assert_eq!(lookup_game_slug("id-without-slug"), None);
    }
}
