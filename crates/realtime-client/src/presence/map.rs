use std::collections::BTreeMap;

use tracing::trace;

use crate::protocol::{PresenceAction, PresenceMessage};

/// How a map keys its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyBy {
    /// `clientId:connectionId`, for the channel's member set.
    Member,
    /// Client id alone, for the members this connection entered itself.
    ClientId,
}

impl KeyBy {
    fn key(self, item: &PresenceMessage) -> String {
        match self {
            KeyBy::Member => item.member_key(),
            KeyBy::ClientId => item.client_id.clone().unwrap_or_default(),
        }
    }
}

/// Whether `item` supersedes `existing`.
///
/// Messages carrying a real `connectionId:msgSerial:index` id compare by that
/// position. The server also makes up leaves for connections that dropped; those
/// ids say nothing about order, so when either side looks made up the
/// timestamps decide, with a tie going to the newcomer. Detecting "made up" is
/// a heuristic, see [`PresenceMessage::is_synthesized`].
pub(crate) fn newer_than(item: &PresenceMessage, existing: &PresenceMessage) -> bool {
    if item.is_synthesized() || existing.is_synthesized() {
        return item.timestamp.unwrap_or_default() >= existing.timestamp.unwrap_or_default();
    }
    match (item.parse_id(), existing.parse_id()) {
        (Some(item), Some(existing)) => item > existing,
        // An unparseable id can't be ordered; keep what we have.
        (None, Some(_)) => false,
        (Some(_), None) | (None, None) => true,
    }
}

/// A presence set with last-writer-wins entries and SYNC residual tracking.
#[derive(Debug)]
pub(crate) struct PresenceMap {
    key_by: KeyBy,
    map: BTreeMap<String, PresenceMessage>,
    residual: Option<BTreeMap<String, PresenceMessage>>,
    sync_in_progress: bool,
}

impl PresenceMap {
    pub fn new(key_by: KeyBy) -> Self {
        Self {
            key_by,
            map: BTreeMap::new(),
            residual: None,
            sync_in_progress: false,
        }
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress
    }

    pub fn get(&self, key: &str) -> Option<&PresenceMessage> {
        self.map.get(key)
    }

    /// Records an enter, update or present. Returns false when an equal or
    /// newer message for the same member is already held.
    pub fn put(&mut self, item: &PresenceMessage) -> bool {
        let mut item = item.clone();
        if matches!(item.action, PresenceAction::Enter | PresenceAction::Update) {
            item.action = PresenceAction::Present;
        }
        let key = self.key_by.key(&item);
        if let Some(residual) = self.residual.as_mut() {
            residual.remove(&key);
        }
        if let Some(existing) = self.map.get(&key) {
            if !newer_than(&item, existing) {
                return false;
            }
        }
        self.map.insert(key, item);
        true
    }

    /// Records a leave. While a sync is running the member stays behind as an
    /// `absent` witness so an older `present` in the sync can't resurrect it.
    pub fn remove(&mut self, item: &PresenceMessage) -> bool {
        let key = self.key_by.key(item);
        if let Some(existing) = self.map.get(&key) {
            if !newer_than(item, existing) {
                return false;
            }
        }
        if self.sync_in_progress {
            let mut witness = item.clone();
            witness.action = PresenceAction::Absent;
            self.map.insert(key, witness);
        } else {
            self.map.remove(&key);
        }
        true
    }

    /// Members, absent witnesses excluded.
    pub fn values(&self) -> Vec<PresenceMessage> {
        self.map
            .values()
            .filter(|item| item.action != PresenceAction::Absent)
            .cloned()
            .collect()
    }

    pub fn list(&self, client_id: Option<&str>, connection_id: Option<&str>) -> Vec<PresenceMessage> {
        self.map
            .values()
            .filter(|item| item.action != PresenceAction::Absent)
            .filter(|item| client_id.is_none_or(|id| item.client_id.as_deref() == Some(id)))
            .filter(|item| connection_id.is_none_or(|id| item.connection_id.as_deref() == Some(id)))
            .cloned()
            .collect()
    }

    /// Snapshots the current members as candidates for implicit removal.
    /// Repeated calls during one sync are ignored.
    pub fn start_sync(&mut self) {
        trace!(target: "realtime::presence", in_progress = self.sync_in_progress, "start sync");
        if !self.sync_in_progress {
            self.residual = Some(self.map.clone());
            self.sync_in_progress = true;
        }
    }

    /// Ends a sync: drops absent witnesses and every member the sync never
    /// confirmed. Returns the latter so callers can announce their leave.
    pub fn end_sync(&mut self) -> Vec<PresenceMessage> {
        trace!(target: "realtime::presence", in_progress = self.sync_in_progress, "end sync");
        if !self.sync_in_progress {
            return Vec::new();
        }
        self.map.retain(|_, item| item.action != PresenceAction::Absent);
        let residual = self.residual.take().unwrap_or_default();
        for key in residual.keys() {
            self.map.remove(key);
        }
        self.sync_in_progress = false;
        residual.into_values().collect()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.residual = None;
        self.sync_in_progress = false;
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn msg(action: PresenceAction, client: &str, conn: &str, id: &str, ts: i64) -> PresenceMessage {
        let mut msg = PresenceMessage::new(action, Some(client.into()), Value::Null);
        msg.connection_id = Some(conn.into());
        msg.id = Some(id.into());
        msg.timestamp = Some(ts);
        msg
    }

    #[test]
    fn higher_index_wins_in_either_order() {
        let first = msg(PresenceAction::Update, "alice", "c1", "c1:5:0", 10);
        let second = msg(PresenceAction::Update, "alice", "c1", "c1:5:1", 5);

        let mut map = PresenceMap::new(KeyBy::Member);
        assert!(map.put(&first));
        assert!(map.put(&second));
        assert_eq!(map.values()[0].id.as_deref(), Some("c1:5:1"));

        let mut map = PresenceMap::new(KeyBy::Member);
        assert!(map.put(&second));
        assert!(!map.put(&first));
        assert_eq!(map.values()[0].id.as_deref(), Some("c1:5:1"));
    }

    #[test]
    fn msg_serial_outranks_index() {
        let older = msg(PresenceAction::Enter, "bob", "c2", "c2:4:9", 0);
        let newer = msg(PresenceAction::Update, "bob", "c2", "c2:5:0", 0);
        assert!(newer_than(&newer, &older));
        assert!(!newer_than(&older, &newer));
    }

    #[test]
    fn synthesized_leave_compares_by_timestamp() {
        let present = msg(PresenceAction::Present, "carol", "c3", "c3:9:0", 1_000);
        let stale_leave = msg(PresenceAction::Leave, "carol", "c3", "server-made:0:0", 999);
        let fresh_leave = msg(PresenceAction::Leave, "carol", "c3", "server-made:0:0", 1_000);

        let mut map = PresenceMap::new(KeyBy::Member);
        map.put(&present);
        assert!(!map.remove(&stale_leave));
        assert_eq!(map.values().len(), 1);
        assert!(map.remove(&fresh_leave));
        assert!(map.is_empty());
    }

    #[test]
    fn enter_is_stored_as_present() {
        let mut map = PresenceMap::new(KeyBy::Member);
        map.put(&msg(PresenceAction::Enter, "dan", "c4", "c4:0:0", 0));
        assert_eq!(map.values()[0].action, PresenceAction::Present);
    }

    #[test]
    fn unconfirmed_members_are_residual_after_sync() {
        let mut map = PresenceMap::new(KeyBy::Member);
        map.put(&msg(PresenceAction::Enter, "a", "c1", "c1:0:0", 0));
        map.put(&msg(PresenceAction::Enter, "b", "c2", "c2:0:0", 0));

        map.start_sync();
        map.start_sync();
        map.put(&msg(PresenceAction::Present, "a", "c1", "c1:0:0", 0));
        let gone = map.end_sync();

        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].client_id.as_deref(), Some("b"));
        let left: Vec<_> = map.values().into_iter().map(|m| m.client_id).collect();
        assert_eq!(left, vec![Some("a".to_string())]);
        assert!(!map.sync_in_progress());
    }

    #[test]
    fn leave_during_sync_blocks_older_present() {
        let mut map = PresenceMap::new(KeyBy::Member);
        map.start_sync();
        assert!(map.remove(&msg(PresenceAction::Leave, "e", "c5", "c5:3:0", 0)));
        assert!(map.values().is_empty());
        assert!(!map.put(&msg(PresenceAction::Present, "e", "c5", "c5:2:0", 0)));
        assert!(map.end_sync().is_empty());
        assert!(map.is_empty());
    }

    #[test]
    fn list_filters_by_client_and_connection() {
        let mut map = PresenceMap::new(KeyBy::Member);
        map.put(&msg(PresenceAction::Enter, "a", "c1", "c1:0:0", 0));
        map.put(&msg(PresenceAction::Enter, "a", "c2", "c2:0:0", 0));
        map.put(&msg(PresenceAction::Enter, "b", "c2", "c2:0:1", 0));
        assert_eq!(map.list(Some("a"), None).len(), 2);
        assert_eq!(map.list(None, Some("c2")).len(), 2);
        assert_eq!(map.list(Some("a"), Some("c2")).len(), 1);
    }

    #[test]
    fn own_members_key_by_client_id() {
        let mut mine = PresenceMap::new(KeyBy::ClientId);
        mine.put(&msg(PresenceAction::Enter, "me", "c1", "c1:0:0", 0));
        assert!(mine.get("me").is_some());
    }
}
