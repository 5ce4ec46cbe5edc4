//! Root controller: decides between the sign-in screens and the chat.

use std::sync::Arc;

use thiserror::Error;

use crate::api::{AgentApi, ApiError, NewUser};
use crate::chat::ChatSession;
use crate::models::{ObjectUrls, User};
use crate::phone::clean_phone;
use crate::store::{KeyValueStore, PersistentCell, SESSION_KEY, USER_KEY};

/// Why a sign-in attempt did not get the user to the chat. The display text
/// is the notice shown on the form.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Por favor, digite seu número de telefone.")]
    MissingPhone,

    #[error("Usuário não encontrado. Verifique o número ou crie uma nova conta.")]
    UserNotFound,

    #[error("Erro ao conectar com o servidor. Tente novamente.")]
    Connection(#[source] ApiError),

    #[error("Por favor, preencha todos os campos.")]
    MissingFields,

    #[error("Erro ao criar conta. Tente novamente.")]
    Registration(#[source] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Login,
    Register,
    Chat,
}

pub struct App<A: AgentApi + ?Sized> {
    api: Arc<A>,
    store: Arc<dyn KeyValueStore>,
    object_urls: Arc<ObjectUrls>,
    user: PersistentCell<Option<User>>,
    chat: Option<ChatSession<A>>,
    show_login: bool,
    notice: Option<String>,
}

impl<A: AgentApi + ?Sized> App<A> {
    /// Restore the signed-in user from `store`. An unreadable record is
    /// discarded and the app starts signed out.
    pub fn open(api: Arc<A>, store: Arc<dyn KeyValueStore>) -> Self {
        let user = PersistentCell::open_or_reset(store.clone(), USER_KEY, None);
        let mut app = Self {
            api,
            store,
            object_urls: Arc::new(ObjectUrls::new()),
            user,
            chat: None,
            show_login: true,
            notice: None,
        };
        if let Some(user) = app.user.get().clone() {
            tracing::info!(user_id = %user.id, "Restored signed-in user");
            app.chat = Some(app.new_chat(&user));
        }
        app
    }

    pub fn screen(&self) -> Screen {
        match (self.user.get(), self.show_login) {
            (Some(_), _) => Screen::Chat,
            (None, true) => Screen::Login,
            (None, false) => Screen::Register,
        }
    }

    pub fn current_user(&self) -> Option<&User> {
        self.user.get().as_ref()
    }

    pub fn chat(&self) -> Option<&ChatSession<A>> {
        self.chat.as_ref()
    }

    /// Registry shared by the chat transcript and the audio recorder.
    pub fn object_urls(&self) -> &Arc<ObjectUrls> {
        &self.object_urls
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    /// Shown above an empty chat.
    pub fn greeting(&self) -> Option<String> {
        let user = self.user.get().as_ref()?;
        match &self.chat {
            Some(chat) if chat.message_count() > 0 => None,
            _ => Some(format!("Olá, {}!", user.name)),
        }
    }

    pub fn show_register(&mut self) {
        self.show_login = false;
        self.notice = None;
    }

    pub fn show_login(&mut self) {
        self.show_login = true;
        self.notice = None;
    }

    /// Sign in with an existing account.
    pub async fn login(&mut self, phone_input: &str) -> Result<User, AuthError> {
        let phone = clean_phone(phone_input);
        if phone.is_empty() {
            return Err(self.reject(AuthError::MissingPhone));
        }
        self.notice = None;

        let lookup = self.api.lookup_user(&phone).await;
        let record = match lookup {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Err(self.reject(AuthError::UserNotFound)),
            Err(e) => return Err(self.reject(AuthError::Connection(e))),
        };

        let user = User {
            id: record.id,
            name: record.name.unwrap_or_default(),
            phone_number: phone,
            created_at: record
                .created_at
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        };
        tracing::info!(user_id = %user.id, "Signed in");
        Ok(self.sign_in(user))
    }

    /// Create an account and sign in with it.
    pub async fn register(&mut self, name: &str, phone_input: &str) -> Result<User, AuthError> {
        let phone = clean_phone(phone_input);
        if name.trim().is_empty() || phone.is_empty() {
            return Err(self.reject(AuthError::MissingFields));
        }
        self.notice = None;

        let request = NewUser {
            phone_number: phone.clone(),
            name: name.to_string(),
        };
        let created = self.api.create_user(&request).await;
        let created = match created {
            Ok(created) => created,
            Err(e) => return Err(self.reject(AuthError::Registration(e))),
        };

        let user = User {
            id: created.id,
            name: request.name,
            phone_number: phone,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        tracing::info!(user_id = %user.id, "Account created");
        Ok(self.sign_in(user))
    }

    /// Forget the user and the agent session, back to the login screen.
    pub fn logout(&mut self) {
        if let Some(chat) = self.chat.take() {
            chat.clear();
        }
        self.user.clear();
        // The chat may not exist (e.g. it was never opened), so clear the
        // session entry directly as well.
        if let Err(e) = self.store.remove(SESSION_KEY) {
            tracing::error!(error = %e, "Failed to remove stored session");
        }
        self.show_login = true;
        self.notice = None;
        tracing::info!("Signed out");
    }

    fn sign_in(&mut self, user: User) -> User {
        self.chat = Some(self.new_chat(&user));
        self.user.set(Some(user.clone()));
        self.notice = None;
        user
    }

    fn new_chat(&self, user: &User) -> ChatSession<A> {
        ChatSession::new(self.api.clone(), self.store.clone(), user.id.clone())
            .with_object_urls(self.object_urls.clone())
    }

    fn reject(&mut self, error: AuthError) -> AuthError {
        match &error {
            AuthError::Connection(source) | AuthError::Registration(source) => {
                tracing::warn!(error = %source, "{error}");
            }
            _ => tracing::debug!("{error}"),
        }
        self.notice = Some(error.to_string());
        error
    }
}
