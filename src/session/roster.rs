//! The peer table: player-id-indexed slots and resync acknowledgement
//! tracking.

use std::net::SocketAddr;

use crate::transport::PeerHandle;
use crate::{PlayerId, MAX_PLAYERS};

/// One occupied player slot. The transport handle is `None` for the local
/// player's own slot and for roster entries whose connection has not been
/// established (or has been torn down); an absent handle is the type-level
/// statement that there is nothing to send to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerSlot {
    pub nickname: String,
    pub addr: SocketAddr,
    pub peer: Option<PeerHandle>,
}

/// Fixed-size map from [`PlayerId`] to [`PeerSlot`]. Host-authoritative:
/// joiners only ever overwrite it wholesale from a Reset.
#[derive(Debug, Default)]
pub(crate) struct Roster {
    slots: [Option<PeerSlot>; MAX_PLAYERS],
}

impl Roster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, player: PlayerId) -> Option<&PeerSlot> {
        self.slots.get(player.as_usize()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, player: PlayerId) -> Option<&mut PeerSlot> {
        self.slots.get_mut(player.as_usize()).and_then(Option::as_mut)
    }

    pub(crate) fn occupy(&mut self, player: PlayerId, slot: PeerSlot) {
        self.slots[player.as_usize()] = Some(slot);
    }

    /// Clears a slot, returning what occupied it.
    pub(crate) fn clear(&mut self, player: PlayerId) -> Option<PeerSlot> {
        self.slots.get_mut(player.as_usize()).and_then(Option::take)
    }

    /// Empties the whole table, returning the occupied slots for teardown.
    pub(crate) fn take_all(&mut self) -> Vec<(PlayerId, PeerSlot)> {
        let mut taken = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(slot) = slot.take() {
                taken.push((PlayerId::new(index), slot));
            }
        }
        taken
    }

    pub(crate) fn num_players(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub(crate) fn occupied_ids(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| PlayerId::new(index))
    }

    /// The id the host assigns when the requested one is unavailable.
    pub(crate) fn lowest_free_id(&self) -> Option<PlayerId> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(PlayerId::new)
    }

    /// Finds the player occupying a slot bound to `peer`.
    pub(crate) fn player_by_peer(&self, peer: PeerHandle) -> Option<PlayerId> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.peer == Some(peer)))
            .map(PlayerId::new)
    }

    /// Finds the player whose roster address matches `addr`.
    pub(crate) fn player_by_addr(&self, addr: SocketAddr) -> Option<PlayerId> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|s| s.addr == addr))
            .map(PlayerId::new)
    }
}

/// Which players have acknowledged the current resync. Bit `i` is player
/// `i`; the host sets its own bit the moment it broadcasts a Reset.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResetBitset(u32);

impl ResetBitset {
    pub(crate) fn only(player: PlayerId) -> Self {
        ResetBitset(1 << player.as_usize())
    }

    pub(crate) fn set(&mut self, player: PlayerId) {
        self.0 |= 1 << player.as_usize();
    }

    pub(crate) fn contains(self, player: PlayerId) -> bool {
        self.0 & (1 << player.as_usize()) != 0
    }

    pub(crate) fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// `true` once every occupied roster slot has acknowledged.
    pub(crate) fn covers(self, roster: &Roster) -> bool {
        roster.occupied_ids().all(|id| self.contains(id))
    }
}
