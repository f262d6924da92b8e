use async_trait::async_trait;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Unknown,
    Granted,
    Denied,
}

/// Authorization to scan for and connect to peripherals.
///
/// Checked before every scan, since a grant can be revoked between sessions.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    fn check(&self) -> PermissionStatus;

    /// Ask for everything scanning and connecting need. Resolves to `true`
    /// only when every capability was granted.
    async fn request(&self) -> bool;
}

/// Gate for platforms without runtime radio authorization (Linux, desktop
/// Windows). Always granted.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unrestricted;

#[async_trait]
impl PermissionGate for Unrestricted {
    fn check(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn request(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Scan,
    Connect,
    Location,
}

/// The capability set a platform requires before scanning.
pub const RADIO_CAPABILITIES: [Capability; 3] =
    [Capability::Scan, Capability::Connect, Capability::Location];

/// Platform side of runtime authorization.
#[async_trait]
pub trait Authorizer: Send + Sync {
    fn status(&self, capability: Capability) -> PermissionStatus;

    /// Prompt for all `capabilities` at once and report each outcome.
    async fn request_all(&self, capabilities: &[Capability]) -> Vec<(Capability, bool)>;
}

/// Gate for platforms that grant radio access at runtime, capability by
/// capability.
pub struct RuntimeGate<A> {
    authorizer: A,
    required: Vec<Capability>,
}

impl<A: Authorizer> RuntimeGate<A> {
    pub fn new(authorizer: A) -> Self {
        Self::with_capabilities(authorizer, &RADIO_CAPABILITIES)
    }

    pub fn with_capabilities(authorizer: A, required: &[Capability]) -> Self {
        Self {
            authorizer,
            required: required.to_vec(),
        }
    }
}

#[async_trait]
impl<A: Authorizer> PermissionGate for RuntimeGate<A> {
    fn check(&self) -> PermissionStatus {
        let mut status = PermissionStatus::Granted;
        for capability in self.required.iter() {
            match self.authorizer.status(*capability) {
                PermissionStatus::Denied => return PermissionStatus::Denied,
                PermissionStatus::Unknown => status = PermissionStatus::Unknown,
                PermissionStatus::Granted => {}
            }
        }
        status
    }

    async fn request(&self) -> bool {
        let outcome = self.authorizer.request_all(&self.required).await;
        let mut granted = true;
        for capability in self.required.iter() {
            let ok = outcome
                .iter()
                .any(|(c, ok)| c == capability && *ok);
            if !ok {
                warn!("capability {:?} was not granted", capability);
                granted = false;
            }
        }
        debug!("permission request resolved, granted: {}", granted);
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeAuthorizer {
        state: Mutex<HashMap<Capability, PermissionStatus>>,
        grants: Vec<Capability>,
    }

    impl FakeAuthorizer {
        fn new(grants: &[Capability]) -> Self {
            Self {
                state: Mutex::new(HashMap::new()),
                grants: grants.to_vec(),
            }
        }
    }

    #[async_trait]
    impl Authorizer for FakeAuthorizer {
        fn status(&self, capability: Capability) -> PermissionStatus {
            *self
                .state
                .lock()
                .unwrap()
                .get(&capability)
                .unwrap_or(&PermissionStatus::Unknown)
        }

        async fn request_all(&self, capabilities: &[Capability]) -> Vec<(Capability, bool)> {
            let mut state = self.state.lock().unwrap();
            capabilities
                .iter()
                .map(|c| {
                    let ok = self.grants.contains(c);
                    let status = if ok {
                        PermissionStatus::Granted
                    } else {
                        PermissionStatus::Denied
                    };
                    state.insert(*c, status);
                    (*c, ok)
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn unrestricted_is_always_granted() {
        assert_eq!(Unrestricted.check(), PermissionStatus::Granted);
        assert!(Unrestricted.request().await);
    }

    #[tokio::test]
    async fn full_grant_is_granted() {
        let gate = RuntimeGate::new(FakeAuthorizer::new(&RADIO_CAPABILITIES));
        assert_eq!(gate.check(), PermissionStatus::Unknown);
        assert!(gate.request().await);
        assert_eq!(gate.check(), PermissionStatus::Granted);
    }

    #[tokio::test]
    async fn partial_grant_is_denial() {
        let gate = RuntimeGate::new(FakeAuthorizer::new(&[Capability::Scan, Capability::Connect]));
        assert!(!gate.request().await);
        assert_eq!(gate.check(), PermissionStatus::Denied);
    }

    #[tokio::test]
    async fn missing_outcome_is_denial() {
        struct Silent;

        #[async_trait]
        impl Authorizer for Silent {
            fn status(&self, _: Capability) -> PermissionStatus {
                PermissionStatus::Unknown
            }

            async fn request_all(&self, _: &[Capability]) -> Vec<(Capability, bool)> {
                Vec::new()
            }
        }

        let gate = RuntimeGate::with_capabilities(Silent, &[Capability::Scan]);
        assert!(!gate.request().await);
    }
}
