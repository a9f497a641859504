//! Lease-based token reservations.
//!
//! Planning a spend and committing it are separate steps, and between them a
//! token must not be picked by a second plan. Each reserved token carries a
//! lease `{lease_id, expires_at}`. A lease that nobody confirms or releases
//! simply lapses at `expires_at`, so a crashed or abandoned payment can't
//! lock value forever.
//!
//! Reservation is all-or-nothing: if any requested token is already held by a
//! live lease, nothing is reserved.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::token::TokenId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug)]
pub struct ReservationTable {
    leases: Mutex<HashMap<TokenId, Lease>>,
    timeout: Duration,
}

impl ReservationTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Reserve every id under one fresh lease, or none of them. On conflict
    /// returns the first id that is already held. Lapsed entries are dropped
    /// on the way in.
    pub fn reserve(&self, ids: &[TokenId], now: DateTime<Utc>) -> Result<Lease, TokenId> {
        let mut leases = self.leases.lock();
        leases.retain(|_, l| l.is_live(now));
        if let Some(taken) = ids
            .iter()
            .find(|id| leases.get(*id).is_some_and(|l| l.is_live(now)))
        {
            return Err(*taken);
        }

        let lease = Lease {
            lease_id: Uuid::new_v4(),
            expires_at: now + self.timeout,
        };
        for id in ids {
            leases.insert(*id, lease);
        }
        Ok(lease)
    }

    /// Put one more token under an existing live lease (a division output
    /// replacing its reserved parent).
    pub fn extend(&self, lease: &Lease, id: TokenId, now: DateTime<Utc>) -> Result<(), TokenId> {
        let mut leases = self.leases.lock();
        if leases.get(&id).is_some_and(|l| l.is_live(now) && l.lease_id != lease.lease_id) {
            return Err(id);
        }
        leases.insert(id, *lease);
        Ok(())
    }

    /// Whether every id is still held by `lease_id` at `now`.
    pub fn holds(&self, lease_id: &Uuid, ids: &[TokenId], now: DateTime<Utc>) -> bool {
        let leases = self.leases.lock();
        ids.iter().all(|id| {
            leases
                .get(id)
                .is_some_and(|l| l.lease_id == *lease_id && l.is_live(now))
        })
    }

    /// Drop every entry belonging to `lease_id`. Returns how many went.
    pub fn release(&self, lease_id: &Uuid) -> usize {
        let mut leases = self.leases.lock();
        let before = leases.len();
        leases.retain(|_, l| l.lease_id != *lease_id);
        before - leases.len()
    }

    /// Drop specific ids regardless of which lease holds them.
    pub fn release_ids(&self, ids: &[TokenId]) {
        let mut leases = self.leases.lock();
        for id in ids {
            leases.remove(id);
        }
    }

    pub fn is_reserved(&self, id: &TokenId, now: DateTime<Utc>) -> bool {
        self.leases.lock().get(id).is_some_and(|l| l.is_live(now))
    }

    /// Forget lapsed leases. Lapsed entries are already ignored by every
    /// other method, and `reserve` drops them too.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut leases = self.leases.lock();
        let before = leases.len();
        leases.retain(|_, l| l.is_live(now));
        before - leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ids(n: usize) -> Vec<TokenId> {
        (0..n).map(|_| TokenId::random()).collect()
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let table = ReservationTable::new(Duration::seconds(60));
        let now = Utc::now();
        let t = ids(3);

        table.reserve(&t[..2], now).unwrap();
        let conflict = table.reserve(&t[1..], now).unwrap_err();
        assert_eq!(conflict, t[1]);
        assert!(!table.is_reserved(&t[2], now), "partial reservation leaked");
    }

    #[test]
    fn leases_lapse() {
        let table = ReservationTable::new(Duration::seconds(60));
        let now = Utc::now();
        let t = ids(1);
        let lease = table.reserve(&t, now).unwrap();

        let later = now + Duration::seconds(61);
        assert!(!table.is_reserved(&t[0], later));
        assert!(!table.holds(&lease.lease_id, &t, later));
        assert!(table.reserve(&t, later).is_ok());
    }

    #[test]
    fn release_frees_only_that_lease() {
        let table = ReservationTable::new(Duration::seconds(60));
        let now = Utc::now();
        let t = ids(2);
        let a = table.reserve(&t[..1], now).unwrap();
        table.reserve(&t[1..], now).unwrap();

        assert_eq!(table.release(&a.lease_id), 1);
        assert!(!table.is_reserved(&t[0], now));
        assert!(table.is_reserved(&t[1], now));
    }

    #[test]
    fn extend_adds_to_live_lease() {
        let table = ReservationTable::new(Duration::seconds(60));
        let now = Utc::now();
        let t = ids(2);
        let lease = table.reserve(&t[..1], now).unwrap();
        table.extend(&lease, t[1], now).unwrap();
        assert!(table.holds(&lease.lease_id, &t, now));
    }

    #[test]
    fn purge_drops_lapsed_entries() {
        let table = ReservationTable::new(Duration::seconds(1));
        let now = Utc::now();
        table.reserve(&ids(3), now).unwrap();
        assert_eq!(table.purge_expired(now + Duration::seconds(2)), 3);
    }

    #[test]
    fn reserve_drops_lapsed_entries() {
        let table = ReservationTable::new(Duration::seconds(1));
        let now = Utc::now();
        table.reserve(&ids(3), now).unwrap();
        table.reserve(&ids(1), now + Duration::seconds(2)).unwrap();
        assert_eq!(table.leases.lock().len(), 1);
        assert_eq!(table.purge_expired(now + Duration::seconds(2)), 0);
    }

    #[test]
    fn concurrent_reservations_have_one_winner() {
        let table = Arc::new(ReservationTable::new(Duration::seconds(60)));
        let now = Utc::now();
        let t = ids(1);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = Arc::clone(&table);
                let t = t.clone();
                std::thread::spawn(move || table.reserve(&t, now).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}
