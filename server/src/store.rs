//! Persistence collaborator for room and tournament records.
//!
//! Records are kept as encoded blobs, the same bytes a durable backend would
//! write. The read endpoints ("open rooms", "tournament by id") are served from
//! here rather than from the live partitions.

use crate::error::StoreError;
use dashmap::DashMap;
use shared::protocol::{decode, encode};
use shared::{RoomSnapshot, RoomStatus, RoomSummary, TournamentId, TournamentSnapshot};

pub trait Store: Send + Sync {
    fn save_room(&self, room: &RoomSnapshot) -> Result<(), StoreError>;
    fn remove_room(&self, code: &str) -> Result<(), StoreError>;
    fn save_tournament(&self, tournament: &TournamentSnapshot) -> Result<(), StoreError>;
    fn remove_tournament(&self, id: TournamentId) -> Result<(), StoreError>;
    fn open_rooms(&self) -> Result<Vec<RoomSummary>, StoreError>;
    fn tournament(&self, id: TournamentId) -> Result<Option<TournamentSnapshot>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: DashMap<String, Vec<u8>>,
    tournaments: DashMap<TournamentId, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save_room(&self, room: &RoomSnapshot) -> Result<(), StoreError> {
        self.rooms.insert(room.code.clone(), encode(room)?);
        Ok(())
    }

    fn remove_room(&self, code: &str) -> Result<(), StoreError> {
        self.rooms.remove(code);
        Ok(())
    }

    fn save_tournament(&self, tournament: &TournamentSnapshot) -> Result<(), StoreError> {
        self.tournaments.insert(tournament.id, encode(tournament)?);
        Ok(())
    }

    fn remove_tournament(&self, id: TournamentId) -> Result<(), StoreError> {
        self.tournaments.remove(&id);
        Ok(())
    }

    fn open_rooms(&self) -> Result<Vec<RoomSummary>, StoreError> {
        let mut rooms = Vec::new();
        for entry in self.rooms.iter() {
            let room: RoomSnapshot = decode(entry.value())?;
            if room.status == RoomStatus::Open {
                rooms.push(room.summary());
            }
        }
        rooms.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(rooms)
    }

    fn tournament(&self, id: TournamentId) -> Result<Option<TournamentSnapshot>, StoreError> {
        match self.tournaments.get(&id) {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{PlayerSlot, RoomConfig};

    fn room(code: &str, max: u32) -> RoomSnapshot {
        RoomSnapshot::new(code.to_string(), PlayerSlot::new(1, "host"), max, RoomConfig::default())
    }

    #[test]
    fn test_only_open_rooms_are_listed() {
        let store = MemoryStore::new();
        store.save_room(&room("BBBBBB", 4)).unwrap();
        let mut full = room("AAAAAA", 2);
        full.add_player(PlayerSlot::new(2, "guest"));
        store.save_room(&full).unwrap();

        let open = store.open_rooms().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].code, "BBBBBB");
        assert_eq!(open[0].host_name, "host");

        store.remove_room("BBBBBB").unwrap();
        assert!(store.open_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_tournament_round_trips_through_store() {
        let store = MemoryStore::new();
        let t = TournamentSnapshot::new(9, "cup".into(), PlayerSlot::new(1, "a"), 8);
        store.save_tournament(&t).unwrap();

        assert_eq!(store.tournament(9).unwrap(), Some(t));
        assert_eq!(store.tournament(10).unwrap(), None);

        store.remove_tournament(9).unwrap();
        assert_eq!(store.tournament(9).unwrap(), None);
    }
}
