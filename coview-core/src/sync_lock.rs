use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{Id, Introspect};

pub type LockToken = Id<SyncLock>;

/// A local, advisory lock that expires on its own.
///
/// While held, the client ignores its own engine events and incoming room
/// notifications, which are assumed to be echoes of what it just did.
#[derive(Debug, Default)]
pub struct SyncLock {
    hold: Mutex<Option<Hold>>,
}

#[derive(Debug, Clone, Copy)]
struct Hold {
    token: LockToken,
    until: Instant,
}

#[derive(Debug)]
pub struct SyncLockIntrospection {
    pub held: bool,
    pub remaining: Option<Duration>,
}

impl SyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `ttl`, replacing any hold that is already in place.
    pub fn acquire(&self, ttl: Duration) -> LockToken {
        let token = LockToken::new();

        *self.hold.lock() = Some(Hold {
            token,
            until: Instant::now() + ttl,
        });

        token
    }

    pub fn is_held(&self) -> bool {
        self.remaining().is_some()
    }

    /// Returns how long the current hold lasts, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        let hold = *self.hold.lock();
        let now = Instant::now();

        hold.filter(|h| h.until > now).map(|h| h.until - now)
    }

    /// Releases the lock early, but only if `token` is still the current hold.
    pub fn release(&self, token: LockToken) {
        let mut hold = self.hold.lock();

        if hold.map(|h| h.token) == Some(token) {
            *hold = None;
        }
    }

    /// Drops any hold, used when the client detaches from a room.
    pub fn clear(&self) {
        self.hold.lock().take();
    }
}

impl Introspect<SyncLockIntrospection> for SyncLock {
    fn introspect(&self) -> SyncLockIntrospection {
        let remaining = self.remaining();

        SyncLockIntrospection {
            held: remaining.is_some(),
            remaining,
        }
    }
}
