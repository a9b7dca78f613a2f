//! Chat presence tracking. The IRC transport lives outside this daemon; the
//! miner only decides where it should be present and keeps the joined set
//! consistent with each streamer's chat policy.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Default)]
pub struct ChatManager {
    joined: Mutex<HashSet<String>>,
}

impl ChatManager {
    pub fn new() -> ChatManager {
        ChatManager::default()
    }

    pub fn join(&self, login: &str) {
        if self.joined.lock().unwrap().insert(login.to_owned()) {
            debug!(streamer = login, "Joined chat");
        }
    }

    pub fn leave(&self, login: &str) {
        if self.joined.lock().unwrap().remove(login) {
            debug!(streamer = login, "Left chat");
        }
    }

    pub fn is_joined(&self, login: &str) -> bool {
        self.joined.lock().unwrap().contains(login)
    }

    pub fn joined_count(&self) -> usize {
        self.joined.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn join_leave_tracking() {
        let chat = ChatManager::new();
        assert!(!chat.is_joined("a"));

        chat.join("a");
        chat.join("a");
        assert!(chat.is_joined("a"));
        assert_eq!(chat.joined_count(), 1);

        chat.leave("a");
        assert!(!chat.is_joined("a"));
        chat.leave("a");
        assert_eq!(chat.joined_count(), 0);
    }
}
