//! The map index: spatial partitioning of connections by map.
//!
//! Position updates dominate traffic volume, so broadcast cost must be
//! proportional to one map's live occupancy, not to every connection on
//! the server. The index keeps two kinds of membership per map:
//!
//! - **occupants** — non-spectator connections. This is the set the
//!   protocol's invariants are stated over: a non-spectator connection
//!   is in exactly one bucket while registered, and never two.
//! - **watchers** — spectator connections. Watchers receive the same
//!   map-scoped broadcasts (they observe occupancy and movement) but
//!   are never part of the occupant set, never listed, never counted.
//!
//! Empty buckets of either kind are removed immediately.

use std::collections::{HashMap, HashSet};

use overmap_protocol::MapId;
use overmap_transport::ConnectionId;

/// Partition of live connections by the map they occupy or watch.
#[derive(Debug, Default)]
pub struct MapIndex {
    occupants: HashMap<MapId, HashSet<ConnectionId>>,
    watchers: HashMap<MapId, HashSet<ConnectionId>>,
}

impl MapIndex {
    /// Creates a new, empty index.
    pub fn new() -> Self {
        Self {
            occupants: HashMap::new(),
            watchers: HashMap::new(),
        }
    }

    /// Adds a non-spectator connection to a map's occupant bucket.
    pub fn add_occupant(&mut self, conn: ConnectionId, map: &MapId) {
        self.occupants.entry(map.clone()).or_default().insert(conn);
    }

    /// Removes a connection from a map's occupant bucket, pruning the
    /// bucket if it empties. Removing an absent member is a no-op.
    pub fn remove_occupant(&mut self, conn: ConnectionId, map: &MapId) {
        if let Some(bucket) = self.occupants.get_mut(map) {
            bucket.remove(&conn);
            if bucket.is_empty() {
                self.occupants.remove(map);
            }
        }
    }

    /// Adds a spectator connection to a map's watcher set.
    pub fn add_watcher(&mut self, conn: ConnectionId, map: &MapId) {
        self.watchers.entry(map.clone()).or_default().insert(conn);
    }

    /// Removes a spectator from a map's watcher set, pruning as above.
    pub fn remove_watcher(&mut self, conn: ConnectionId, map: &MapId) {
        if let Some(set) = self.watchers.get_mut(map) {
            set.remove(&conn);
            if set.is_empty() {
                self.watchers.remove(map);
            }
        }
    }

    /// The occupants of a map. Empty if the map has no bucket; lookup
    /// never allocates one.
    pub fn occupants_of<'a>(
        &'a self,
        map: &MapId,
    ) -> impl Iterator<Item = ConnectionId> + 'a {
        self.occupants.get(map).into_iter().flatten().copied()
    }

    /// Number of occupants of a map.
    pub fn occupant_count(&self, map: &MapId) -> usize {
        self.occupants.get(map).map_or(0, HashSet::len)
    }

    /// Whether a connection occupies the given map.
    pub fn is_occupant(&self, conn: ConnectionId, map: &MapId) -> bool {
        self.occupants.get(map).is_some_and(|b| b.contains(&conn))
    }

    /// The broadcast audience for a map: occupants plus watchers,
    /// minus `excluding`. This is the fan-out scope for `playerJoined`,
    /// `playerMoved`, and `playerLeft`.
    pub fn audience_of(
        &self,
        map: &MapId,
        excluding: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let occupants = self.occupants.get(map).into_iter().flatten();
        let watchers = self.watchers.get(map).into_iter().flatten();
        occupants
            .chain(watchers)
            .copied()
            .filter(|conn| Some(*conn) != excluding)
            .collect()
    }

    /// Number of maps with at least one occupant.
    pub fn occupied_map_count(&self) -> usize {
        self.occupants.len()
    }
}

// =========================================================================
// Tests
// =========================================================================
