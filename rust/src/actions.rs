#[derive(uniffi::Enum, Debug, Clone)]
pub enum AppAction {
    // Auth
    Login {
        user_id: String,
    },
    Logout,

    // Chat
    OpenChat {
        chat_id: String,
        chat_name: String,
        member_ids: Vec<String>,
    },
    CloseChat,
    SendMessage {
        chat_id: String,
        text: String,
    },
    RetryMessage {
        chat_id: String,
        temp_id: String,
    },
    DeleteFailedMessage {
        chat_id: String,
        temp_id: String,
    },

    // Typing
    TypingStarted {
        chat_id: String,
    },
    TypingStopped {
        chat_id: String,
    },

    // Lifecycle
    Foregrounded,
    Backgrounded,

    // UI
    DismissBanner,
    ClearToast,
}

impl AppAction {
    /// Log-safe name. Never includes message text.
    pub fn tag(&self) -> &'static str {
        match self {
            // Auth
            AppAction::Login { .. } => "Login",
            AppAction::Logout => "Logout",

            // Chat
            AppAction::OpenChat { .. } => "OpenChat",
            AppAction::CloseChat => "CloseChat",
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::RetryMessage { .. } => "RetryMessage",
            AppAction::DeleteFailedMessage { .. } => "DeleteFailedMessage",

            // Typing
            AppAction::TypingStarted { .. } => "TypingStarted",
            AppAction::TypingStopped { .. } => "TypingStopped",

            // Lifecycle
            AppAction::Foregrounded => "Foregrounded",
            AppAction::Backgrounded => "Backgrounded",

            // UI
            AppAction::DismissBanner => "DismissBanner",
            AppAction::ClearToast => "ClearToast",
        }
    }
}
