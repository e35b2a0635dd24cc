//! Platform connectivity signal.
//!
//! The platform layer flips [`ConnectivitySignal::set_online`]; the health
//! monitor and recovery service read it synchronously and watch it for
//! transitions.

use tokio::sync::watch;
use tracing::info;

#[derive(Clone, Debug)]
pub struct ConnectivitySignal {
    tx: watch::Sender<bool>,
}

impl ConnectivitySignal {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Records a platform transition. Returns `true` when the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "platform connectivity changed");
        }
        changed
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivitySignal {
    fn default() -> Self {
        Self::online()
    }
}
