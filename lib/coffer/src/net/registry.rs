//! Session bookkeeping: a pool of slots with a live set and an index by
//! donor IP. At most one session exists per donor address.

use crate::net::session::Session;
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::Token;
use std::net::Ipv4Addr;

/// Tokens 0 and 1 belong to the listener and the signal source.
const TOKEN_BASE: usize = 2;

pub struct Registry {
    slots: Vec<Option<Session>>,
    free: Vec<usize>,
    live: IndexSet<usize>,
    by_ip: HashMap<Ipv4Addr, usize>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            slots: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            by_ip: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    #[inline]
    pub fn token(slot: usize) -> Token {
        Token(slot + TOKEN_BASE)
    }

    #[inline]
    pub fn slot(token: Token) -> usize {
        token.0 - TOKEN_BASE
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<usize> {
        self.by_ip.get(&ip).copied()
    }

    /// Stores a session in a free slot and indexes it by donor IP. The
    /// caller must have removed any previous session for that IP.
    pub fn insert(&mut self, session: Session) -> usize {
        debug_assert!(!self.by_ip.contains_key(&session.ip()));

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        self.by_ip.insert(session.ip(), slot);
        self.slots[slot] = Some(session);
        self.live.insert(slot);
        slot
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Session> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Takes a session out, recycling its slot.
    pub fn remove(&mut self, slot: usize) -> Option<Session> {
        let session = self.slots.get_mut(slot).and_then(Option::take)?;

        self.by_ip.remove(&session.ip());
        self.live.swap_remove(&slot);
        self.free.push(slot);
        Some(session)
    }

    /// Snapshot of the live slots, for sweeps that remove as they go.
    pub fn live_slots(&self) -> Vec<usize> {
        self.live.iter().copied().collect()
    }
}
