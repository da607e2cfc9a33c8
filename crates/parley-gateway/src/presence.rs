use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use parley_types::events::GatewayEvent;
use parley_types::models::Identity;

use crate::dispatcher::Dispatcher;

/// How sessions of the same identity count toward presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceMode {
    /// Online while at least one session is open.
    #[default]
    Counted,
    /// One flag per identity: a second add is a no-op and any disconnect
    /// takes the identity offline, even with other sessions still open.
    Single,
}

impl FromStr for PresenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "counted" => Ok(Self::Counted),
            "single" => Ok(Self::Single),
            other => Err(format!("unknown presence mode '{}'", other)),
        }
    }
}

/// Process-wide set of connected identities.
///
/// Every add/remove publishes the full set on the presence topic, even when
/// the call changed nothing. The snapshot is taken and published while the
/// lock is held, so broadcasts leave in mutation order and each one is the
/// exact state right after its mutation.
#[derive(Clone)]
pub struct PresenceRegistry {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    mode: PresenceMode,
    /// identity -> open session count (always 1 in `Single` mode)
    sessions: Mutex<BTreeMap<Identity, usize>>,
    dispatcher: Dispatcher,
}

impl PresenceRegistry {
    pub fn new(dispatcher: Dispatcher, mode: PresenceMode) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                mode,
                sessions: Mutex::new(BTreeMap::new()),
                dispatcher,
            }),
        }
    }

    pub fn mode(&self) -> PresenceMode {
        self.inner.mode
    }

    pub fn add_identity(&self, identity: &Identity) {
        let mut sessions = self.lock();
        let count = sessions.entry(identity.clone()).or_insert(0);
        *count = match self.inner.mode {
            PresenceMode::Counted => *count + 1,
            PresenceMode::Single => 1,
        };
        debug!("Presence add {} ({} sessions)", identity, count);
        self.publish(&sessions);
    }

    pub fn remove_identity(&self, identity: &Identity) {
        let mut sessions = self.lock();
        let remaining = match sessions.get(identity).copied() {
            Some(count) if self.inner.mode == PresenceMode::Counted && count > 1 => {
                sessions.insert(identity.clone(), count - 1);
                count - 1
            }
            Some(_) => {
                sessions.remove(identity);
                0
            }
            None => 0,
        };
        debug!("Presence remove {} ({} sessions left)", identity, remaining);
        self.publish(&sessions);
    }

    /// Publish the current set without mutating it.
    pub fn broadcast(&self) {
        let sessions = self.lock();
        self.publish(&sessions);
    }

    /// Sorted list of identities currently online.
    pub fn snapshot(&self) -> Vec<Identity> {
        self.lock().keys().cloned().collect()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.lock().contains_key(identity)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Identity, usize>> {
        self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, sessions: &BTreeMap<Identity, usize>) {
        let users = sessions.keys().cloned().collect();
        self.inner.dispatcher.publish(GatewayEvent::PresenceUpdate { users });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tokio::sync::broadcast::Receiver;

    use super::*;
    use crate::dispatcher::Dispatch;

    fn ids(names: &[&str]) -> Vec<Identity> {
        names.iter().map(|n| Identity::from(*n)).collect()
    }

    fn next_users(rx: &mut Receiver<Arc<Dispatch>>) -> Vec<Identity> {
        match &rx.try_recv().unwrap().event {
            GatewayEvent::PresenceUpdate { users } => users.clone(),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn every_call_broadcasts_the_full_set() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();
        let presence = PresenceRegistry::new(dispatcher, PresenceMode::Single);

        presence.add_identity(&"alice".into());
        assert_eq!(next_users(&mut rx), ids(&["alice"]));

        presence.add_identity(&"bob".into());
        assert_eq!(next_users(&mut rx), ids(&["alice", "bob"]));

        // duplicate add and absent remove still broadcast
        presence.add_identity(&"alice".into());
        assert_eq!(next_users(&mut rx), ids(&["alice", "bob"]));
        presence.remove_identity(&"zed".into());
        assert_eq!(next_users(&mut rx), ids(&["alice", "bob"]));

        presence.remove_identity(&"alice".into());
        assert_eq!(next_users(&mut rx), ids(&["bob"]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_matches_added_minus_removed() {
        let ops: &[(bool, &str)] = &[
            (true, "a"),
            (true, "b"),
            (true, "a"),
            (false, "c"),
            (false, "a"),
            (true, "c"),
            (false, "b"),
            (true, "b"),
        ];

        let presence = PresenceRegistry::new(Dispatcher::new(), PresenceMode::Single);
        let mut expected = BTreeSet::new();
        for (add, name) in ops {
            let id = Identity::from(*name);
            if *add {
                presence.add_identity(&id);
                expected.insert(id);
            } else {
                presence.remove_identity(&id);
                expected.remove(&id);
            }
            assert_eq!(presence.snapshot(), expected.iter().cloned().collect::<Vec<_>>());
        }
    }

    #[test]
    fn single_mode_drops_identity_on_any_disconnect() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();
        let presence = PresenceRegistry::new(dispatcher, PresenceMode::Single);
        let carol = Identity::from("carol");

        presence.add_identity(&carol); // session 1
        presence.add_identity(&carol); // session 2
        presence.remove_identity(&carol); // session 1 closes

        next_users(&mut rx);
        next_users(&mut rx);
        assert!(next_users(&mut rx).is_empty());
        assert!(!presence.contains(&carol));
    }

    #[test]
    fn counted_mode_keeps_identity_until_last_session() {
        let presence = PresenceRegistry::new(Dispatcher::new(), PresenceMode::Counted);
        let carol = Identity::from("carol");

        presence.add_identity(&carol);
        presence.add_identity(&carol);
        presence.remove_identity(&carol);
        assert!(presence.contains(&carol));

        presence.remove_identity(&carol);
        assert!(!presence.contains(&carol));

        // extra removes never go negative
        presence.remove_identity(&carol);
        presence.add_identity(&carol);
        assert!(presence.contains(&carol));
    }

    #[test]
    fn concurrent_sessions_settle_to_empty() {
        let presence = PresenceRegistry::new(Dispatcher::new(), PresenceMode::Counted);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let presence = presence.clone();
                std::thread::spawn(move || {
                    let id = Identity::new(format!("user{}", i % 3));
                    for _ in 0..100 {
                        presence.add_identity(&id);
                        presence.remove_identity(&id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(presence.snapshot().is_empty());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("counted".parse::<PresenceMode>().unwrap(), PresenceMode::Counted);
        assert_eq!("SINGLE".parse::<PresenceMode>().unwrap(), PresenceMode::Single);
        assert!("per-device".parse::<PresenceMode>().is_err());
    }
}
