//! Authoritative in-memory roster with an ssrc reverse index.
//!
//! The ssrc index and the roster are always mutated within the same
//! synchronous call, so observers never see a dangling reverse entry.

use std::collections::BTreeMap;

use crate::core::{Participant, PeerId, Ssrc};

/// Before/after delta for one roster mutation. `before` absent means
/// insertion; `now` absent means removal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantUpdate {
    pub before: Option<Participant>,
    pub now: Option<Participant>,
}

/// Result of an upsert. An ssrc handover mutates a second participant
/// (the displaced stream owner), whose delta rides along so observers
/// see both changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub update: ParticipantUpdate,
    pub displaced: Option<ParticipantUpdate>,
}

#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    members: BTreeMap<PeerId, Participant>,
    /// Display order; resorted only on ordering-relevant events.
    order: Vec<PeerId>,
    peer_by_ssrc: BTreeMap<Ssrc, PeerId>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, peer: PeerId) -> Option<&Participant> {
        self.members.get(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut Participant> {
        self.members.get_mut(&peer)
    }

    pub fn peer_by_ssrc(&self, ssrc: Ssrc) -> Option<PeerId> {
        self.peer_by_ssrc.get(&ssrc).copied()
    }

    pub fn ssrc_entries(&self) -> impl Iterator<Item = (Ssrc, PeerId)> + '_ {
        self.peer_by_ssrc.iter().map(|(s, p)| (*s, *p))
    }

    /// Insert or replace a participant, keeping the ssrc index in lockstep.
    ///
    /// If the incoming ssrc is currently mapped to a different peer the
    /// stream has been handed over: the old owner loses its ssrc field and
    /// the mapping moves. Returns the mutation delta, plus the displaced
    /// owner's delta when a handover occurred.
    pub fn upsert(&mut self, participant: Participant) -> UpsertOutcome {
        let peer = participant.peer;
        let before = self.members.get(&peer).cloned();

        if let Some(prev) = &before
            && prev.ssrc != participant.ssrc
            && let Some(old_ssrc) = prev.ssrc
            && self.peer_by_ssrc.get(&old_ssrc) == Some(&peer)
        {
            self.peer_by_ssrc.remove(&old_ssrc);
        }

        let mut displaced_update = None;
        if let Some(new_ssrc) = participant.ssrc {
            if let Some(&other) = self.peer_by_ssrc.get(&new_ssrc)
                && other != peer
                && let Some(displaced) = self.members.get_mut(&other)
            {
                let displaced_before = displaced.clone();
                displaced.ssrc = None;
                displaced_update = Some(ParticipantUpdate {
                    before: Some(displaced_before),
                    now: Some(displaced.clone()),
                });
            }
            self.peer_by_ssrc.insert(new_ssrc, peer);
        }

        if before.is_none() {
            self.order.push(peer);
        }
        self.members.insert(peer, participant.clone());

        UpsertOutcome {
            update: ParticipantUpdate {
                before,
                now: Some(participant),
            },
            displaced: displaced_update,
        }
    }

    /// Remove a participant and its ssrc mapping, if any.
    pub fn remove(&mut self, peer: PeerId) -> Option<ParticipantUpdate> {
        let removed = self.members.remove(&peer)?;
        if let Some(ssrc) = removed.ssrc
            && self.peer_by_ssrc.get(&ssrc) == Some(&peer)
        {
            self.peer_by_ssrc.remove(&ssrc);
        }
        self.order.retain(|p| *p != peer);
        Some(ParticipantUpdate {
            before: Some(removed),
            now: None,
        })
    }

    /// Participants in display order.
    pub fn ordered(&self) -> impl Iterator<Item = &Participant> {
        self.order.iter().filter_map(|peer| self.members.get(peer))
    }

    /// Re-establish the display order.
    ///
    /// Callers invoke this only on events that can change ordering-relevant
    /// fields (speaking edges, last-active updates, joins) rather than on
    /// every mutation, so bulk snapshot application stays cheap. The sort
    /// is stable; equal keys keep their current relative order.
    pub fn resort(&mut self) {
        let members = &self.members;
        self.order.sort_by(|a, b| {
            let (pa, pb) = match (members.get(a), members.get(b)) {
                (Some(pa), Some(pb)) => (pa, pb),
                _ => return std::cmp::Ordering::Equal,
            };
            pb.speaking
                .cmp(&pa.speaking)
                .then_with(|| pb.last_active.cmp(&pa.last_active))
                .then_with(|| pa.joined_at.cmp(&pb.joined_at))
                .then_with(|| pb.raised_hand_rating.cmp(&pa.raised_hand_rating))
        });
    }
}
