// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Providers let the gate run in different hosts by plugging the
//! host-specific services into the engine: how the ingress hook is
//! installed on the receive path, and where validated triggers come
//! from. Each one has an in-process implementation used for embedding
//! and testing.

use crate::ddi::sync::KRwLock;
use crate::engine::trigger::TriggerSource;
use core::fmt;
use knock_api::ConnState;
use knock_api::KnockError;
use knock_api::Verdict;
use std::sync::Arc;

/// The callback installed on the receive path.
pub type IngressFn = Arc<dyn Fn(&[u8], ConnState) -> Verdict + Send + Sync>;

/// The set of all host-specific providers required by a gate.
pub struct Providers {
    pub ingress: Arc<dyn IngressProvider>,
    pub trigger: Box<dyn TriggerSource>,
}

/// An ingress provider installs the gate's decision function on the
/// host's packet receive path.
///
/// At most one hook is registered at a time. Once `unregister`
/// returns, the host makes no new calls into the hook.
pub trait IngressProvider: Send + Sync {
    fn register(&self, hook: IngressFn) -> Result<(), KnockError>;
    fn unregister(&self);
}

/// An in-process ingress path.
///
/// The host (or a test) hands packets to [`LocalIngress::deliver`],
/// which runs them through whatever hook is registered.
#[derive(Default)]
pub struct LocalIngress {
    hook: KRwLock<Option<IngressFn>>,
}

impl LocalIngress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        self.hook.read().is_some()
    }

    /// Run a packet through the registered hook.
    ///
    /// With no hook registered the receive path is ungated and every
    /// packet is accepted.
    pub fn deliver(&self, pkt: &[u8], conn: ConnState) -> Verdict {
        match self.hook.read().as_ref() {
            Some(hook) => hook(pkt, conn),
            None => Verdict::Accept,
        }
    }
}

impl IngressProvider for LocalIngress {
    fn register(&self, hook: IngressFn) -> Result<(), KnockError> {
        let mut slot = self.hook.write();
        if slot.is_some() {
            return Err(KnockError::Hook(
                "an ingress hook is already registered".to_string(),
            ));
        }

        *slot = Some(hook);
        Ok(())
    }

    fn unregister(&self) {
        // A call in flight holds the read lock; taking the write lock
        // waits it out.
        *self.hook.write() = None;
    }
}

impl fmt::Debug for LocalIngress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIngress")
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_deliver_unregister() {
        let ingress = LocalIngress::new();
        assert_eq!(ingress.deliver(&[], ConnState::New), Verdict::Accept);

        let hook: IngressFn = Arc::new(|pkt: &[u8], _: ConnState| {
            if pkt.is_empty() { Verdict::Drop } else { Verdict::Accept }
        });
        ingress.register(hook.clone()).unwrap();
        assert!(ingress.is_registered());
        assert_eq!(ingress.deliver(&[], ConnState::New), Verdict::Drop);
        assert_eq!(ingress.deliver(&[1], ConnState::New), Verdict::Accept);

        assert!(matches!(ingress.register(hook), Err(KnockError::Hook(_))));

        ingress.unregister();
        assert!(!ingress.is_registered());
        assert_eq!(ingress.deliver(&[], ConnState::New), Verdict::Accept);
    }
}
