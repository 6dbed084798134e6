// Receiver side of notifications: relay inbox, debounce, banner queue and the platform notifier.

use super::*;
use crate::notifications::{route, Delivery, NotificationQueueEntry};
use crate::state::{now_millis, ChatNotification};

impl AppCore {
    fn platform_notifier(&self) -> Option<Arc<dyn PlatformNotifier>> {
        match self.notifier.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub(super) fn on_relay_snapshot(
        &mut self,
        session: u64,
        entries: Vec<(String, NotificationQueueEntry)>,
    ) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        let user_id = sess.user_id.clone();
        let ingested = sess.notifications.ingest(entries, now_millis());
        if ingested.consumed.is_empty() {
            return;
        }
        tracing::debug!(count = ingested.consumed.len(), "notifications buffered");

        let relay = self.backends.relay.clone();
        let consumed = ingested.consumed;
        self.runtime.spawn(async move {
            for id in consumed {
                if let Err(e) = relay.delete(&user_id, &id).await {
                    tracing::warn!(%e, entry = %id, "failed to delete relay entry");
                }
            }
        });

        if let Some(generation) = ingested.debounce_generation {
            self.post_after(
                self.config.notification_debounce(),
                InternalEvent::NotificationDebounceFired {
                    session,
                    generation,
                },
            );
        }
    }

    pub(super) fn on_notification_debounce_fired(&mut self, session: u64, generation: u64) {
        let foreground = self.foreground;
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        let ready = sess.notifications.flush(generation);
        if ready.is_empty() {
            return;
        }
        let active_chat = sess.open_chat.as_ref().map(|c| c.chat_id.clone());

        let mut platform: Vec<ChatNotification> = Vec::new();
        for notification in ready {
            match route(notification, active_chat.as_deref(), foreground) {
                Delivery::Suppressed => {
                    tracing::debug!("notification suppressed for the open chat");
                }
                Delivery::Banner(n) => sess.banners.offer(&n),
                Delivery::Platform(n) => platform.push(n),
            }
        }

        if !platform.is_empty() {
            match self.platform_notifier() {
                Some(notifier) => {
                    for n in platform {
                        notifier.dismiss(n.chat_id.clone());
                        notifier.schedule(n);
                    }
                }
                None => tracing::warn!("no platform notifier set; dropping notifications"),
            }
        }
        self.sync_state();
    }

    pub(super) fn dismiss_banner(&mut self) {
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let token = sess.token;
        if let Some(generation) = sess.banners.dismiss() {
            self.post_after(
                self.config.banner_advance(),
                InternalEvent::BannerAdvance {
                    session: token,
                    generation,
                },
            );
        }
        self.sync_state();
    }

    pub(super) fn on_banner_advance(&mut self, session: u64, generation: u64) {
        let Some(sess) = self.session_mut(session) else {
            return;
        };
        if sess.banners.advance(generation) {
            self.sync_state();
        }
    }

    /// Opening a chat clears its platform notification and any banner for it.
    pub(super) fn clear_notifications_for(&mut self, chat_id: &str) {
        if let Some(notifier) = self.platform_notifier() {
            notifier.dismiss(chat_id.to_string());
        }
        let Some(sess) = self.session.as_mut() else {
            return;
        };
        let token = sess.token;
        if let Some(generation) = sess.banners.drop_chat(chat_id) {
            self.post_after(
                self.config.banner_advance(),
                InternalEvent::BannerAdvance {
                    session: token,
                    generation,
                },
            );
        }
    }
}
