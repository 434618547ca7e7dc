//! Canonical decoded view of every tracked account, per layer.
//!
//! Readers are unrestricted. Mutators are crate-private: only the
//! reconciler and the delegation state machine write here.

use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{
    accounts::{PersonalRecord, TrackedAccount, TypingSession},
    delegation::DelegationStatus,
    rpc::Layer,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Last observed account per layer. Never merged field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerViews {
    pub base: Option<TrackedAccount>,
    pub rollup: Option<TrackedAccount>,
}

impl LayerViews {
    pub fn get(&self, layer: Layer) -> Option<&TrackedAccount> {
        match layer {
            Layer::Base => self.base.as_ref(),
            Layer::Rollup => self.rollup.as_ref(),
        }
    }

    fn slot_mut(&mut self, layer: Layer) -> &mut Option<TrackedAccount> {
        match layer {
            Layer::Base => &mut self.base,
            Layer::Rollup => &mut self.rollup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    AccountChanged {
        address: Pubkey,
        layer: Layer,
        present: bool,
    },
    StatusChanged {
        address: Pubkey,
        from: DelegationStatus,
        to: DelegationStatus,
    },
}

#[derive(Debug)]
pub struct AccountStateStore {
    views: DashMap<Pubkey, LayerViews>,
    statuses: DashMap<Pubkey, DelegationStatus>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for AccountStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStateStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            views: DashMap::new(),
            statuses: DashMap::new(),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// `None` means the account does not exist (yet) on `layer`.
    pub fn get(&self, address: &Pubkey, layer: Layer) -> Option<TrackedAccount> {
        self.views
            .get(address)
            .and_then(|views| views.get(layer).cloned())
    }

    pub fn views(&self, address: &Pubkey) -> LayerViews {
        self.views
            .get(address)
            .map(|views| views.clone())
            .unwrap_or_default()
    }

    pub fn delegation_status(&self, address: &Pubkey) -> DelegationStatus {
        self.statuses
            .get(address)
            .map(|status| *status)
            .unwrap_or(DelegationStatus::Unknown)
    }

    /// The view selected wholesale by the address's delegation status.
    pub fn effective(&self, address: &Pubkey) -> Option<TrackedAccount> {
        let layer = self.delegation_status(address).read_layer();
        self.get(address, layer)
    }

    pub fn effective_session(&self, address: &Pubkey) -> Option<TypingSession> {
        match self.effective(address) {
            Some(TrackedAccount::Session(session)) => Some(session),
            _ => None,
        }
    }

    pub fn record(&self, address: &Pubkey) -> Option<PersonalRecord> {
        match self.effective(address) {
            Some(TrackedAccount::Record(record)) => Some(record),
            _ => None,
        }
    }

    pub(crate) fn set(&self, address: Pubkey, layer: Layer, account: TrackedAccount) {
        let changed = {
            let mut views = self.views.entry(address).or_default();
            let slot = views.slot_mut(layer);
            let changed = slot.as_ref() != Some(&account);
            *slot = Some(account);
            changed
        };
        if changed {
            trace!("Stored {} view of {}", layer, address);
            let _ = self.events.send(StoreEvent::AccountChanged {
                address,
                layer,
                present: true,
            });
        }
    }

    pub(crate) fn clear(&self, address: &Pubkey, layer: Layer) {
        let cleared = self
            .views
            .get_mut(address)
            .and_then(|mut views| views.slot_mut(layer).take())
            .is_some();
        if cleared {
            trace!("Cleared {} view of {}", layer, address);
            let _ = self.events.send(StoreEvent::AccountChanged {
                address: *address,
                layer,
                present: false,
            });
        }
    }

    /// Returns the previous status.
    pub(crate) fn set_delegation_status(
        &self,
        address: Pubkey,
        status: DelegationStatus,
    ) -> DelegationStatus {
        let previous = self
            .statuses
            .insert(address, status)
            .unwrap_or(DelegationStatus::Unknown);
        if previous != status {
            let _ = self.events.send(StoreEvent::StatusChanged {
                address,
                from: previous,
                to: status,
            });
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(words_typed: u32) -> TrackedAccount {
        TrackedAccount::Session(TypingSession {
            player: Pubkey::new_unique(),
            words_typed,
            correct_words: words_typed,
            errors: 0,
            wpm: 0,
            accuracy: 100,
            is_active: true,
            started_at: 0,
            ended_at: None,
        })
    }

    fn stored(store: &AccountStateStore, address: Pubkey, layer: Layer) -> TrackedAccount {
        store.get(&address, layer).unwrap()
    }

    #[test]
    fn absent_is_distinct_per_layer() {
        let store = AccountStateStore::new();
        let address = Pubkey::new_unique();
        assert_eq!(store.get(&address, Layer::Base), None);

        let account = session(1);
        store.set(address, Layer::Base, account.clone());
        assert_eq!(store.get(&address, Layer::Base), Some(account));
        assert_eq!(store.get(&address, Layer::Rollup), None);
    }

    #[test]
    fn effective_view_follows_delegation_status() {
        let store = AccountStateStore::new();
        let address = Pubkey::new_unique();
        let base = session(1);
        let rollup = session(5);
        store.set(address, Layer::Base, base.clone());
        store.set(address, Layer::Rollup, rollup.clone());

        assert_eq!(store.effective(&address), Some(base.clone()));
        store.set_delegation_status(address, DelegationStatus::Delegated);
        assert_eq!(store.effective(&address), Some(rollup.clone()));
        store.set_delegation_status(address, DelegationStatus::Committing);
        assert_eq!(store.effective(&address), Some(rollup));
        store.set_delegation_status(address, DelegationStatus::Undelegated);
        assert_eq!(store.effective(&address), Some(base));
    }

    #[test]
    fn delegated_without_rollup_view_is_absent() {
        let store = AccountStateStore::new();
        let address = Pubkey::new_unique();
        store.set(address, Layer::Base, session(3));
        store.set_delegation_status(address, DelegationStatus::Delegated);
        assert_eq!(store.effective(&address), None);
    }

    #[tokio::test]
    async fn mutations_are_broadcast() {
        let store = AccountStateStore::new();
        let mut events = store.subscribe_events();
        let address = Pubkey::new_unique();

        store.set(address, Layer::Rollup, session(2));
        // Same value twice is not a change.
        store.set(address, Layer::Rollup, stored(&store, address, Layer::Rollup));
        store.clear(&address, Layer::Rollup);
        store.clear(&address, Layer::Rollup);
        let previous = store.set_delegation_status(address, DelegationStatus::Undelegated);
        assert_eq!(previous, DelegationStatus::Unknown);

        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::AccountChanged {
                address,
                layer: Layer::Rollup,
                present: true
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::AccountChanged {
                address,
                layer: Layer::Rollup,
                present: false
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::StatusChanged {
                address,
                from: DelegationStatus::Unknown,
                to: DelegationStatus::Undelegated
            }
        );
    }
}
