mod config;
mod liveness;
mod messaging;
mod notify;
mod session;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use flume::Sender;

use crate::actions::AppAction;
use crate::backends::{Backends, PlatformNotifier, ReachabilityProbe};
use crate::connectivity::HttpReachabilityProbe;
use crate::state::{AppState, AuthState, ChatViewState};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use session::Session;

pub(crate) type SharedNotifier = Arc<RwLock<Option<Arc<dyn PlatformNotifier>>>>;

pub struct AppCore {
    pub state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    data_dir: String,
    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,

    backends: Backends,
    probe: Arc<dyn ReachabilityProbe>,
    notifier: SharedNotifier,

    session: Option<Session>,
    // Monotonic tokens; stale completions compare against these.
    session_seq: u64,
    chat_seq: u64,

    foreground: bool,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
        backends: Backends,
        notifier: SharedNotifier,
    ) -> Self {
        let config = config::load_app_config(&data_dir);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .expect("tokio runtime");

        let probe: Arc<dyn ReachabilityProbe> = match backends.probe.clone() {
            Some(p) => p,
            None => Arc::new(HttpReachabilityProbe::new(
                config.probe_url(),
                config.probe_timeout(),
            )),
        };

        let this = Self {
            state: AppState::empty(),
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            data_dir,
            config,
            runtime,
            backends,
            probe,
            notifier,
            session: None,
            session_seq: 0,
            chat_seq: 0,
            foreground: true,
        };

        // Ensure FfiApp.state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    /// Re-projects the session into `state` and emits only if something visible changed.
    fn sync_state(&mut self) {
        let mut next = self.state.clone();
        self.project_into(&mut next);
        if next != self.state {
            self.state = next;
            self.emit_state();
        }
    }

    fn project_into(&mut self, state: &mut AppState) {
        let now = crate::state::now_millis();
        let stale_ms = self.config.presence_stale_ms();
        let Some(sess) = self.session.as_mut() else {
            state.auth = AuthState::LoggedOut;
            state.connectivity = Default::default();
            state.presence = crate::state::PresencePhase::Uninitialized;
            state.current_chat = None;
            state.outbox_len = 0;
            state.banner = None;
            return;
        };
        state.auth = AuthState::LoggedIn {
            user_id: sess.user_id.clone(),
        };
        state.connectivity = sess.connectivity.state();
        state.presence = sess.presence.phase();
        state.outbox_len = sess.messages.queue_len() as u32;
        state.banner = sess.banners.visible().cloned();
        state.current_chat = match sess.open_chat.as_ref() {
            Some(chat) => Some(ChatViewState {
                chat_id: chat.chat_id.clone(),
                chat_name: chat.chat_name.clone(),
                messages: sess.messages.messages(&chat.chat_id).to_vec(),
                typing_user_ids: chat.typing.current().to_vec(),
                member_presence: chat.members.derive(now, stale_ms),
                stream_error: sess.messages.stream_error(&chat.chat_id).map(str::to_string),
            }),
            None => None,
        };
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Keep toast in state until the UI explicitly clears it.
        self.state.toast = Some(msg.into());
        self.emit_state();
    }

    fn is_logged_in(&self) -> bool {
        self.session.is_some()
    }

    /// The live session, if `token` still names it.
    fn session_mut(&mut self, token: u64) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.token == token)
    }

    /// Posts `event` back to the actor after `delay`.
    fn post_after(&self, delay: Duration, event: InternalEvent) {
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(event)));
        });
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it carries message text.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::NetworkSignal { session, signal } => {
                self.on_network_signal(session, signal)
            }
            InternalEvent::ProbeFinished {
                session,
                generation,
                reachable,
            } => self.on_probe_finished(session, generation, reachable),
            InternalEvent::ReconnectSettled { session, epoch } => {
                self.on_reconnect_settled(session, epoch)
            }
            InternalEvent::AppendFinished {
                session,
                chat_id,
                temp_id,
                origin,
                result,
            } => self.on_append_finished(session, &chat_id, &temp_id, origin, result),
            InternalEvent::RemoteSnapshot {
                session,
                chat,
                chat_id,
                messages,
            } => self.on_remote_snapshot(session, chat, &chat_id, messages),
            InternalEvent::RemoteStreamError {
                session,
                chat,
                chat_id,
                error,
            } => self.on_remote_stream_error(session, chat, &chat_id, error),
            InternalEvent::ChannelConnectivity { session, connected } => {
                self.on_channel_connectivity(session, connected)
            }
            InternalEvent::DisconnectHookRegistered {
                session,
                epoch,
                result,
            } => self.on_disconnect_hook_registered(session, epoch, result),
            InternalEvent::HeartbeatTick { session } => self.on_heartbeat_tick(session),
            InternalEvent::PresenceRecordChanged { session, record } => {
                self.on_presence_record_changed(session, record)
            }
            InternalEvent::MemberPresenceChanged {
                session,
                chat,
                user_id,
                mirror,
            } => self.on_member_presence_changed(session, chat, &user_id, mirror),
            InternalEvent::TypingSnapshot {
                session,
                chat,
                typers,
            } => self.on_typing_snapshot(session, chat, typers),
            InternalEvent::HousekeepingTick { session } => self.on_housekeeping_tick(session),
            InternalEvent::RelaySnapshot { session, entries } => {
                self.on_relay_snapshot(session, entries)
            }
            InternalEvent::NotificationDebounceFired {
                session,
                generation,
            } => self.on_notification_debounce_fired(session, generation),
            InternalEvent::BannerAdvance {
                session,
                generation,
            } => self.on_banner_advance(session, generation),
            InternalEvent::Toast(ref msg) => {
                tracing::info!(msg, "toast");
                self.toast(msg.clone());
            }
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            // Auth
            AppAction::Login { user_id } => {
                let user_id = user_id.trim();
                if user_id.is_empty() {
                    self.toast("Enter a user id");
                    return;
                }
                if let Err(e) = self.start_session(user_id) {
                    self.toast(format!("Login failed: {e:#}"));
                }
            }
            AppAction::Logout => {
                self.sign_out_presence();
                self.stop_session();
                self.state.toast = None;
                self.sync_state();
            }

            // Chat
            AppAction::OpenChat {
                chat_id,
                chat_name,
                member_ids,
            } => {
                if !self.is_logged_in() {
                    return;
                }
                self.open_chat(chat_id, chat_name, member_ids);
            }
            AppAction::CloseChat => {
                if let Some(sess) = self.session.as_mut() {
                    sess.open_chat = None;
                }
                self.sync_state();
            }
            AppAction::SendMessage { chat_id, text } => {
                if !self.is_logged_in() {
                    return;
                }
                let text = text.trim();
                if text.is_empty() {
                    return;
                }
                self.send_message(&chat_id, text);
            }
            AppAction::RetryMessage { chat_id, temp_id } => {
                if !self.is_logged_in() {
                    return;
                }
                self.retry_message(&chat_id, &temp_id);
            }
            AppAction::DeleteFailedMessage { chat_id, temp_id } => {
                if !self.is_logged_in() {
                    return;
                }
                self.delete_failed_message(&chat_id, &temp_id);
            }

            // Typing
            AppAction::TypingStarted { chat_id } => self.set_own_typing(&chat_id, true),
            AppAction::TypingStopped { chat_id } => self.set_own_typing(&chat_id, false),

            // Lifecycle
            AppAction::Foregrounded => self.foreground = true,
            AppAction::Backgrounded => self.foreground = false,

            // UI
            AppAction::DismissBanner => self.dismiss_banner(),
            AppAction::ClearToast => {
                if self.state.toast.is_some() {
                    self.state.toast = None;
                    self.emit_state();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackends;
    use crate::state::{ChatMessage, PresencePhase};
    use flume::Receiver;

    fn write_config(data_dir: &std::path::Path) {
        std::fs::write(
            data_dir.join("courier_config.json"),
            r#"{
                "reconnect_settle_ms": 30,
                "connectivity_poll_ms": 60000,
                "heartbeat_interval_ms": 60000,
                "typing_timeout_ms": 60000,
                "notification_debounce_ms": 20,
                "banner_advance_ms": 20
            }"#,
        )
        .unwrap();
    }

    fn make_core(data_dir: &str, mem: &MemoryBackends) -> (AppCore, Receiver<CoreMsg>) {
        let (update_tx, _update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded();
        let shared = Arc::new(RwLock::new(AppState::empty()));
        let core = AppCore::new(
            update_tx,
            core_tx,
            data_dir.to_string(),
            shared,
            mem.backends(),
            Arc::new(RwLock::new(None)),
        );
        (core, core_rx)
    }

    /// Feeds posted internal events back into the core until nothing arrives for a while.
    fn pump(core: &mut AppCore, rx: &Receiver<CoreMsg>) {
        while let Ok(msg) = rx.recv_timeout(Duration::from_millis(150)) {
            core.handle_message(msg);
        }
    }

    fn login(core: &mut AppCore, rx: &Receiver<CoreMsg>, user: &str) {
        core.handle_message(CoreMsg::Action(AppAction::Login {
            user_id: user.into(),
        }));
        pump(core, rx);
    }

    fn open(core: &mut AppCore, rx: &Receiver<CoreMsg>, chat: &str) {
        core.handle_message(CoreMsg::Action(AppAction::OpenChat {
            chat_id: chat.into(),
            chat_name: "Team".into(),
            member_ids: vec!["alice".into(), "bob".into()],
        }));
        pump(core, rx);
    }

    fn messages(core: &AppCore) -> Vec<ChatMessage> {
        core.state
            .current_chat
            .as_ref()
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    #[test]
    fn login_goes_online_after_hook() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let mem = MemoryBackends::new();
        let (mut core, rx) = make_core(dir.path().to_str().unwrap(), &mem);
        login(&mut core, &rx, "alice");

        assert!(matches!(core.state.auth, AuthState::LoggedIn { .. }));
        assert!(core.state.connectivity.is_initialized);
        assert!(core.state.connectivity.is_connected);
        assert_eq!(core.state.presence, PresencePhase::Online);
        assert!(mem.presence.has_hook("alice"));
        assert!(mem.user_metadata.mirror("alice").is_some_and(|m| m.is_online));
    }

    #[test]
    fn online_send_leaves_single_canonical_row() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let mem = MemoryBackends::new();
        let (mut core, rx) = make_core(dir.path().to_str().unwrap(), &mem);
        login(&mut core, &rx, "alice");
        open(&mut core, &rx, "c1");

        core.handle_message(CoreMsg::Action(AppAction::SendMessage {
            chat_id: "c1".into(),
            text: "Hello".into(),
        }));
        assert!(messages(&core)[0].pending, "placeholder visible before I/O");
        pump(&mut core, &rx);

        let list = messages(&core);
        assert_eq!(list.len(), 1);
        assert!(list[0].id.is_some());
        assert!(!list[0].pending);
        assert_eq!(mem.relay.inbox("bob").len(), 1);
        assert!(mem.relay.inbox("alice").is_empty());
    }

    #[test]
    fn failed_send_is_queued_and_replayed_after_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let mem = MemoryBackends::new();
        let (mut core, rx) = make_core(dir.path().to_str().unwrap(), &mem);
        login(&mut core, &rx, "alice");
        open(&mut core, &rx, "c1");

        mem.network.set_online(false);
        mem.message_log.set_failing(true);
        pump(&mut core, &rx);
        assert!(!core.state.connectivity.is_connected);

        core.handle_message(CoreMsg::Action(AppAction::SendMessage {
            chat_id: "c1".into(),
            text: "Hello".into(),
        }));
        pump(&mut core, &rx);
        assert!(messages(&core)[0].failed);
        assert_eq!(core.state.outbox_len, 1);

        mem.message_log.set_failing(false);
        mem.network.set_online(true);
        pump(&mut core, &rx);

        assert_eq!(core.state.outbox_len, 0);
        let list = messages(&core);
        assert_eq!(list.len(), 1);
        assert!(list[0].id.is_some());
        assert_eq!(mem.message_log.append_count(), 1);
    }

    #[test]
    fn events_from_an_old_session_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let mem = MemoryBackends::new();
        let (mut core, rx) = make_core(dir.path().to_str().unwrap(), &mem);
        login(&mut core, &rx, "alice");
        let old = core.session.as_ref().unwrap().token;
        login(&mut core, &rx, "alice");

        let rev = core.state.rev;
        core.handle_message(CoreMsg::Internal(Box::new(InternalEvent::ChannelConnectivity {
            session: old,
            connected: false,
        })));
        assert_eq!(core.state.presence, PresencePhase::Online);
        assert_eq!(core.state.rev, rev);
    }

    #[test]
    fn logout_writes_offline_presence() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let mem = MemoryBackends::new();
        let (mut core, rx) = make_core(dir.path().to_str().unwrap(), &mem);
        login(&mut core, &rx, "alice");

        core.handle_message(CoreMsg::Action(AppAction::Logout));
        assert_eq!(core.state.auth, AuthState::LoggedOut);
        assert!(mem.user_metadata.mirror("alice").is_some_and(|m| !m.is_online));
        assert_eq!(
            mem.presence.record("alice").map(|r| r.state),
            Some(crate::presence::PresenceState::Offline)
        );
    }
}
