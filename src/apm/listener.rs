use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::apm::event::SdamEvent;
use crate::error::Result;

/// A callback run for every published topology event.
///
/// Hooks run on the thread that published the event, which may be a monitor task holding
/// the cluster's update lock. They may read the cluster (`description`, `get_server`) but
/// must not block or call back into cluster mutation.
pub type SdamHook = Box<dyn Fn(&SdamEvent) + Send + Sync>;

pub struct Listener {
    no_hooks: AtomicBool,
    hooks: RwLock<Vec<SdamHook>>,
}

impl Default for Listener {
    fn default() -> Listener {
        Listener::new()
    }
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            no_hooks: AtomicBool::new(true),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_hook(&self, hook: SdamHook) -> Result<()> {
        let mut guard = self.hooks.write()?;
        self.no_hooks.store(false, Ordering::SeqCst);
        guard.push(hook);
        Ok(())
    }

    /// Runs every registered hook with the event. The event is only built if a hook
    /// is registered.
    pub fn publish<F: FnOnce() -> SdamEvent>(&self, make_event: F) {
        if self.no_hooks.load(Ordering::SeqCst) {
            return;
        }

        let guard = match self.hooks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let event = make_event();
        for hook in guard.iter() {
            hook(&event);
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let count = self.hooks.read().map(|hooks| hooks.len()).unwrap_or(0);
        fmt.debug_struct("Listener").field("hooks", &count).finish()
    }
}
