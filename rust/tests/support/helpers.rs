#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_core::memory::MemoryBackends;
use courier_core::{
    AppAction, AppReconciler, AppState, AppUpdate, ChatMessage, ChatNotification, FfiApp,
    PlatformNotifier,
};
use tempfile::TempDir;

pub fn wait_until(what: &str, timeout: Duration, f: impl FnMut() -> bool) {
    wait_until_with_poll(what, timeout, Duration::from_millis(20), f);
}

pub fn wait_until_with_poll(
    what: &str,
    timeout: Duration,
    poll: Duration,
    mut f: impl FnMut() -> bool,
) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(poll);
    }
    panic!("{what}: condition not met within {timeout:?}");
}

/// Short timers so flows settle in well under a second.
pub fn write_config(data_dir: &str) {
    let path = std::path::Path::new(data_dir).join("courier_config.json");
    let v = serde_json::json!({
        "connectivity_poll_ms": 60_000,
        "reconnect_settle_ms": 30,
        "heartbeat_interval_ms": 60_000,
        "presence_stale_ms": 1_000,
        "typing_timeout_ms": 300,
        "notification_debounce_ms": 50,
        "banner_advance_ms": 30,
    });
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

#[derive(Clone)]
pub struct Collector(pub Arc<Mutex<Vec<AppUpdate>>>);

impl Collector {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn last_toast(&self) -> Option<String> {
        self.0.lock().unwrap().iter().rev().find_map(|u| match u {
            AppUpdate::FullState(s) => s.toast.clone(),
        })
    }

    pub fn revs(&self) -> Vec<u64> {
        self.0.lock().unwrap().iter().map(AppUpdate::rev).collect()
    }
}

impl AppReconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        self.0.lock().unwrap().push(update);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierCall {
    Dismiss(String),
    Schedule(ChatNotification),
}

#[derive(Clone, Default)]
pub struct RecordingNotifier(pub Arc<Mutex<Vec<NotifierCall>>>);

impl RecordingNotifier {
    pub fn calls(&self) -> Vec<NotifierCall> {
        self.0.lock().unwrap().clone()
    }

    pub fn scheduled(&self) -> Vec<ChatNotification> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                NotifierCall::Schedule(n) => Some(n),
                NotifierCall::Dismiss(_) => None,
            })
            .collect()
    }
}

impl PlatformNotifier for RecordingNotifier {
    fn dismiss(&self, chat_id: String) {
        self.0.lock().unwrap().push(NotifierCall::Dismiss(chat_id));
    }

    fn schedule(&self, notification: ChatNotification) {
        self.0.lock().unwrap().push(NotifierCall::Schedule(notification));
    }
}

/// One app instance wired to in-memory backends.
pub struct TestApp {
    pub app: Arc<FfiApp>,
    pub mem: MemoryBackends,
    pub updates: Collector,
    pub notifier: RecordingNotifier,
    dir: Arc<TempDir>,
}

impl TestApp {
    pub fn start() -> Self {
        Self::start_with(MemoryBackends::new())
    }

    /// Several apps may share one set of backends to act as different clients.
    pub fn start_with(mem: MemoryBackends) -> Self {
        let dir = Arc::new(tempfile::tempdir().unwrap());
        write_config(dir.path().to_str().unwrap());
        Self::start_in(mem, dir)
    }

    /// A second app process over the same data dir and backends, as after a restart.
    pub fn reopen(&self) -> Self {
        Self::start_in(self.mem.clone(), self.dir.clone())
    }

    fn start_in(mem: MemoryBackends, dir: Arc<TempDir>) -> Self {
        let data_dir = dir.path().to_str().unwrap().to_string();
        let app = FfiApp::with_backends(data_dir, mem.backends());
        let updates = Collector::new();
        app.listen_for_updates(Box::new(updates.clone()));
        let notifier = RecordingNotifier::default();
        app.set_platform_notifier(Box::new(notifier.clone()));
        Self {
            app,
            mem,
            updates,
            notifier,
            dir,
        }
    }

    pub fn state(&self) -> AppState {
        self.app.state()
    }

    pub fn login(&self, user_id: &str) {
        self.app.dispatch(AppAction::Login {
            user_id: user_id.into(),
        });
        wait_until("logged in and connected", Duration::from_secs(2), || {
            let s = self.state();
            s.connectivity.is_initialized && s.connectivity.is_connected
        });
    }

    pub fn open_chat(&self, chat_id: &str, member_ids: &[&str]) {
        self.app.dispatch(AppAction::OpenChat {
            chat_id: chat_id.into(),
            chat_name: format!("Chat {chat_id}"),
            member_ids: member_ids.iter().map(|m| m.to_string()).collect(),
        });
        wait_until("chat open", Duration::from_secs(2), || {
            self.state()
                .current_chat
                .is_some_and(|c| c.chat_id == chat_id)
        });
    }

    pub fn send(&self, chat_id: &str, text: &str) {
        self.app.dispatch(AppAction::SendMessage {
            chat_id: chat_id.into(),
            text: text.into(),
        });
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state()
            .current_chat
            .map(|c| c.messages)
            .unwrap_or_default()
    }
}
