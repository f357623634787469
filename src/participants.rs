//! This module holds some utilities for working with participants.
//!
//! Often you need to do things like, storing one item for each participant,
//! or getting the lagrange coefficient of a participant, etc.
//! This module tries to provide useful data structures for doing that.

use std::{collections::HashMap, ops::Index};

use k256::Scalar;

use crate::protocol::Participant;

/// Represents a sorted list of participants, without duplicates.
#[derive(Debug, Clone)]
pub struct ParticipantList {
    participants: Vec<Participant>,
    /// This maps each participant to their index in the vector above.
    indices: HashMap<Participant, usize>,
}

impl ParticipantList {
    /// Create a participant list from a slice of participants.
    ///
    /// This will return None if the participants have duplicates.
    pub fn new(participants: &[Participant]) -> Option<Self> {
        let mut out = participants.to_owned();
        out.sort();

        let indices: HashMap<_, _> = out.iter().enumerate().map(|(i, p)| (*p, i)).collect();

        if indices.len() < out.len() {
            return None;
        }

        Some(Self {
            participants: out,
            indices,
        })
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Check if this list has a given participant.
    pub fn contains(&self, participant: Participant) -> bool {
        self.indices.contains_key(&participant)
    }

    /// Iterate over the other participants.
    pub fn others(&self, me: Participant) -> impl Iterator<Item = Participant> + '_ {
        self.participants.iter().filter(move |x| **x != me).copied()
    }

    /// Get the lagrange coefficient for a participant, relative to this list.
    ///
    /// Summing `lagrange(p) * f(p)` over the whole list recovers `f(0)` for
    /// any polynomial `f` of degree less than the size of the list.
    pub fn lagrange(&self, p: Participant) -> Scalar {
        let p_scalar = p.scalar();

        let mut top = Scalar::ONE;
        let mut bot = Scalar::ONE;
        for q in self.others(p) {
            let q_scalar = q.scalar();
            top *= q_scalar;
            bot *= q_scalar - p_scalar;
        }

        // Participants are distinct, so no factor of `bot` is zero.
        top * bot.invert().unwrap()
    }
}

/// A map from participants to elements.
///
/// The idea is that you have one element for each participant.
#[derive(Debug, Clone)]
pub struct ParticipantMap<'a, T> {
    participants: &'a ParticipantList,
    data: Vec<Option<T>>,
    count: usize,
}

impl<'a, T> ParticipantMap<'a, T> {
    /// Create a new map from a list of participants.
    ///
    /// This map only lives as long as that list of participants.
    pub fn new(participants: &'a ParticipantList) -> Self {
        let size = participants.len();
        let mut data = Vec::with_capacity(size);
        data.resize_with(size, || None);

        Self {
            participants,
            data,
            count: 0,
        }
    }

    /// Check if this map is full, i.e. if every participant has put something in.
    pub fn full(&self) -> bool {
        self.count == self.data.len()
    }

    /// Place the data for a participant in this map.
    ///
    /// Returns false, leaving the map untouched, if the participant is unknown
    /// or already has data.
    pub fn put(&mut self, participant: Participant, data: T) -> bool {
        let Some(&i) = self.participants.indices.get(&participant) else {
            return false;
        };
        if self.data[i].is_some() {
            return false;
        }

        self.data[i] = Some(data);
        self.count += 1;
        true
    }
}

impl<'a, T> Index<Participant> for ParticipantMap<'a, T> {
    type Output = T;

    fn index(&self, index: Participant) -> &Self::Output {
        self.data[self.participants.indices[&index]]
            .as_ref()
            .expect("participant has no data in this map")
    }
}

/// Keeps track of which participants we've seen a message from.
#[derive(Debug, Clone)]
pub struct ParticipantCounter<'a> {
    participants: &'a ParticipantList,
    seen: Vec<bool>,
    counter: usize,
}

impl<'a> ParticipantCounter<'a> {
    pub fn new(participants: &'a ParticipantList) -> Self {
        Self {
            participants,
            seen: vec![false; participants.len()],
            counter: participants.len(),
        }
    }

    /// Mark a participant as seen.
    ///
    /// Returns true if this participant is part of the list and was not
    /// seen before.
    pub fn put(&mut self, participant: Participant) -> bool {
        let Some(&i) = self.participants.indices.get(&participant) else {
            return false;
        };
        if self.seen[i] {
            return false;
        }

        self.seen[i] = true;
        self.counter -= 1;
        true
    }

    /// Check if every participant has been seen.
    pub fn full(&self) -> bool {
        self.counter == 0
    }
}

#[cfg(test)]
mod test {
    use rand_core::OsRng;

    use super::*;
    use crate::math::Polynomial;

    #[test]
    fn test_duplicates_rejected() {
        let participants = [Participant::from(0u32), Participant::from(0u32)];
        assert!(ParticipantList::new(&participants).is_none());
    }

    #[test]
    fn test_lagrange_interpolates_constant() {
        let participants: Vec<Participant> = [3u32, 0, 5].into_iter().map(Participant::from).collect();
        let list = ParticipantList::new(&participants).unwrap();
        let f = Polynomial::random(&mut OsRng, 3);

        let interpolated = participants
            .iter()
            .map(|p| list.lagrange(*p) * f.evaluate(&p.scalar()))
            .fold(Scalar::ZERO, |acc, x| acc + x);
        assert_eq!(interpolated, f.evaluate_zero());
    }

    #[test]
    fn test_counter_ignores_strangers_and_repeats() {
        let participants = [Participant::from(0u32), Participant::from(1u32)];
        let list = ParticipantList::new(&participants).unwrap();
        let mut seen = ParticipantCounter::new(&list);

        assert!(!seen.put(Participant::from(9u32)));
        assert!(seen.put(Participant::from(1u32)));
        assert!(!seen.put(Participant::from(1u32)));
        assert!(!seen.full());
        assert!(seen.put(Participant::from(0u32)));
        assert!(seen.full());
    }
}
