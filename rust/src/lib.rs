mod actions;
pub mod backends;
pub mod cache;
pub mod connectivity;
mod core;
pub mod error;
mod logging;
pub mod memory;
pub mod messages;
pub mod notifications;
pub mod presence;
mod state;
mod timer;
pub mod typing;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use actions::AppAction;
pub use backends::{Backends, PlatformNotifier};
pub use error::SyncError;
pub use state::*;
pub use updates::*;

uniffi::setup_scaffolding!();

#[uniffi::export(callback_interface)]
pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

#[derive(uniffi::Object)]
pub struct FfiApp {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
    platform_notifier: Arc<RwLock<Option<Arc<dyn PlatformNotifier>>>>,
}

impl FfiApp {
    /// Starts the app actor against the given remote stores.
    pub fn with_backends(data_dir: String, backends: Backends) -> Arc<Self> {
        logging::init_logging(&data_dir);
        tracing::info!(data_dir = %data_dir, "FfiApp starting");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));
        let platform_notifier: Arc<RwLock<Option<Arc<dyn PlatformNotifier>>>> =
            Arc::new(RwLock::new(None));

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        let notifier_for_core = platform_notifier.clone();
        thread::spawn(move || {
            let mut core = crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                data_dir,
                shared_for_core,
                backends,
                notifier_for_core,
            );
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
            platform_notifier,
        })
    }
}

#[uniffi::export]
impl FfiApp {
    /// Platform entry point. Remote stores are the in-process ones; reachability goes through
    /// the configured HTTP probe.
    #[uniffi::constructor]
    pub fn new(data_dir: String) -> Arc<Self> {
        let backends = Backends {
            probe: None,
            ..memory::MemoryBackends::new().backends()
        };
        Self::with_backends(data_dir, backends)
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }

    pub fn set_platform_notifier(&self, notifier: Box<dyn PlatformNotifier>) {
        let notifier: Arc<dyn PlatformNotifier> = Arc::from(notifier);
        match self.platform_notifier.write() {
            Ok(mut slot) => {
                *slot = Some(notifier);
            }
            Err(poison) => {
                *poison.into_inner() = Some(notifier);
            }
        }
    }
}
