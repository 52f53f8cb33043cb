//! Built-in host capabilities.
//!
//! Each endowment closes over a piece of live host state ([`HostHooks`]).
//! The catalog stores factories, so hooks are only touched when a grant
//! actually includes the capability.

pub mod entropy;
pub mod network;
pub mod notify;
pub mod state;

use std::sync::Arc;

use rand::RngCore;

use super::{CapabilityCatalog, Endowment};

pub use entropy::EntropyEndowment;
pub use network::NetworkEndowment;
pub use notify::{Notification, NotificationKind, NotifyEndowment, NotifySink};
pub use state::{FileStateStore, ManageStateEndowment, MemoryStateStore, StateStore};

pub const MANAGE_STATE: &str = "snap_manageState";
pub const NOTIFY: &str = "snap_notify";
pub const GET_ENTROPY: &str = "snap_getEntropy";
pub const NETWORK_ACCESS: &str = "endowment:network-access";

/// Live host objects the built-in endowments delegate to.
#[derive(Clone)]
pub struct HostHooks {
    pub state: Arc<dyn StateStore>,
    pub notify: NotifySink,
    pub entropy_seed: Arc<[u8]>,
}

impl HostHooks {
    /// Hooks with a logging notification sink and a random entropy seed.
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            state,
            notify: notify::log_sink(),
            entropy_seed: Arc::from(seed.as_slice()),
        }
    }

    pub fn with_entropy_seed(mut self, seed: &[u8]) -> Self {
        self.entropy_seed = Arc::from(seed);
        self
    }

    pub fn with_notify_sink(mut self, sink: NotifySink) -> Self {
        self.notify = sink;
        self
    }
}

impl CapabilityCatalog {
    /// Catalog of every built-in capability, bound to `hooks`.
    pub fn with_builtins(hooks: HostHooks) -> Self {
        let mut catalog = Self::new();

        let state = hooks.state.clone();
        catalog.register(
            MANAGE_STATE,
            Arc::new(move || {
                Arc::new(ManageStateEndowment::new(state.clone())) as Arc<dyn Endowment>
            }),
        );

        let sink = hooks.notify.clone();
        catalog.register(
            NOTIFY,
            Arc::new(move || Arc::new(NotifyEndowment::new(sink.clone())) as Arc<dyn Endowment>),
        );

        let seed = hooks.entropy_seed.clone();
        catalog.register(
            GET_ENTROPY,
            Arc::new(move || Arc::new(EntropyEndowment::new(seed.clone())) as Arc<dyn Endowment>),
        );

        let network: Arc<dyn Endowment> = Arc::new(NetworkEndowment::new());
        catalog.register(NETWORK_ACCESS, Arc::new(move || network.clone()));

        catalog
    }
}
