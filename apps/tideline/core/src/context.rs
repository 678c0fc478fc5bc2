use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::AuthenticationError;
use crate::token::UserTokenSigner;

pub const DEFAULT_LOCALE: &str = "en";

/// Cookie holding the host application's session key.
pub const DEFAULT_SESSION_COOKIE: &str = "sessionid";

const MAX_WINDOW_KEY_LEN: usize = 64;

/// Opaque identifier of one persistent client connection. Clients keep the
/// same id across reconnects by sending it as their window key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub perms: BTreeSet<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
            is_staff: false,
            is_superuser: false,
            perms: BTreeSet::new(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn staff(mut self) -> Self {
        self.is_staff = true;
        self
    }

    pub fn superuser(mut self) -> Self {
        self.is_staff = true;
        self.is_superuser = true;
        self
    }

    pub fn with_perm(mut self, perm: impl Into<String>) -> Self {
        self.perms.insert(perm.into());
        self
    }

    /// Superusers hold every permission.
    pub fn has_perm(&self, perm: &str) -> bool {
        self.is_superuser || self.perms.contains(perm)
    }
}

/// Snapshot of who is asking and from where. Built once per connection (or
/// per server-side trigger) and never mutated afterwards; the `with_*`
/// methods consume the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowContext {
    connection_id: Option<ConnectionId>,
    user: Option<UserIdentity>,
    locale: String,
    topics: Vec<String>,
    #[serde(default)]
    user_agent: String,
    #[serde(default)]
    session: Option<String>,
}

impl Default for WindowContext {
    fn default() -> Self {
        Self::server()
    }
}

impl WindowContext {
    /// Context of code running outside any connection.
    pub fn server() -> Self {
        Self {
            connection_id: None,
            user: None,
            locale: DEFAULT_LOCALE.to_string(),
            topics: Vec::new(),
            user_agent: String::new(),
            session: None,
        }
    }

    pub fn for_connection(connection_id: impl Into<ConnectionId>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            ..Self::server()
        }
    }

    pub fn with_user(mut self, user: UserIdentity) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Key of the browser session the connection belongs to, as set by the
    /// host application.
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Appends topic keys, keeping first-seen order and dropping duplicates.
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for topic in topics {
            let topic = topic.into();
            if !self.topics.contains(&topic) {
                self.topics.push(topic);
            }
        }
        self
    }

    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.id.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }
}

/// The parts of a connection request context steps can look at.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
}

impl ConnectionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Header names are matched case-insensitively.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Mutable state threaded through the context steps.
#[derive(Debug, Clone, Default)]
pub struct ContextDraft {
    pub connection_id: Option<ConnectionId>,
    pub user: Option<UserIdentity>,
    pub locale: Option<String>,
    pub topics: Vec<String>,
    pub user_agent: Option<String>,
    pub session: Option<String>,
}

impl ContextDraft {
    fn finish(self, default_locale: &str) -> WindowContext {
        WindowContext {
            connection_id: self.connection_id,
            user: self.user,
            locale: self
                .locale
                .unwrap_or_else(|| default_locale.to_string()),
            topics: Vec::new(),
            user_agent: self.user_agent.unwrap_or_default(),
            session: self.session,
        }
        .with_topics(self.topics)
    }
}

/// One stage of context construction. Returning an error rejects the
/// connection and stops the pipeline.
pub trait ContextStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        request: &ConnectionRequest,
        draft: &mut ContextDraft,
    ) -> Result<(), AuthenticationError>;
}

#[derive(Clone)]
pub struct ContextPipeline {
    steps: Vec<Arc<dyn ContextStep>>,
    default_locale: String,
}

impl Default for ContextPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPipeline")
            .field(
                "steps",
                &self.steps.iter().map(|step| step.name()).collect::<Vec<_>>(),
            )
            .field("default_locale", &self.default_locale)
            .finish()
    }
}

impl ContextPipeline {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            default_locale: DEFAULT_LOCALE.to_string(),
        }
    }

    /// Window key, locale, user agent and session cookie steps.
    /// Authentication is added by the host.
    pub fn standard() -> Self {
        Self::new()
            .with_step(WindowKeyStep::default())
            .with_step(LocaleStep)
            .with_step(UserAgentStep)
            .with_step(SessionStep::default())
    }

    pub fn with_step(mut self, step: impl ContextStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn with_default_locale(mut self, locale: impl Into<String>) -> Self {
        self.default_locale = locale.into();
        self
    }

    pub fn build(&self, request: &ConnectionRequest) -> Result<WindowContext, AuthenticationError> {
        let mut draft = ContextDraft::default();
        for step in &self.steps {
            if let Err(err) = step.apply(request, &mut draft) {
                debug!(step = step.name(), error = %err, "context pipeline rejected connection");
                return Err(err);
            }
        }
        Ok(draft.finish(&self.default_locale))
    }
}

/// Reads the connection id from the `window_key` query parameter, generating
/// one when it is absent.
#[derive(Debug, Clone)]
pub struct WindowKeyStep {
    pub param: &'static str,
    pub generate_missing: bool,
}

impl Default for WindowKeyStep {
    fn default() -> Self {
        Self {
            param: "window_key",
            generate_missing: true,
        }
    }
}

impl ContextStep for WindowKeyStep {
    fn name(&self) -> &'static str {
        "window_key"
    }

    fn apply(
        &self,
        request: &ConnectionRequest,
        draft: &mut ContextDraft,
    ) -> Result<(), AuthenticationError> {
        match request.query(self.param) {
            Some(key) if is_valid_window_key(key) => {
                draft.connection_id = Some(ConnectionId::from(key));
                Ok(())
            }
            Some(_) => Err(AuthenticationError::new(self.name(), "malformed window key")),
            None if self.generate_missing => {
                draft.connection_id = Some(ConnectionId::generate());
                Ok(())
            }
            None => Err(AuthenticationError::new(self.name(), "window key is required")),
        }
    }
}

/// Window keys are 1 to 64 ASCII letters, digits, `-` or `_`.
pub fn is_valid_window_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_WINDOW_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Authenticates the user from a signed token passed as `?token=` or as a
/// bearer `Authorization` header.
#[derive(Debug, Clone)]
pub struct SignedUserStep {
    signer: UserTokenSigner,
    required: bool,
}

impl SignedUserStep {
    pub fn new(signer: UserTokenSigner) -> Self {
        Self {
            signer,
            required: false,
        }
    }

    /// Reject anonymous connections instead of letting them through.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

impl ContextStep for SignedUserStep {
    fn name(&self) -> &'static str {
        "signed_user"
    }

    fn apply(
        &self,
        request: &ConnectionRequest,
        draft: &mut ContextDraft,
    ) -> Result<(), AuthenticationError> {
        let token = request.query("token").or_else(|| {
            request
                .header("authorization")
                .and_then(|value| value.strip_prefix("Bearer "))
        });
        match token {
            Some(token) => {
                let claims = self
                    .signer
                    .verify(token.trim())
                    .map_err(|err| AuthenticationError::new(self.name(), err.to_string()))?;
                draft.user = Some(claims.user);
                Ok(())
            }
            None if self.required => {
                Err(AuthenticationError::new(self.name(), "user token is required"))
            }
            None => Ok(()),
        }
    }
}

/// Picks the locale from `?lang=` or the first `Accept-Language` entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocaleStep;

impl ContextStep for LocaleStep {
    fn name(&self) -> &'static str {
        "locale"
    }

    fn apply(
        &self,
        request: &ConnectionRequest,
        draft: &mut ContextDraft,
    ) -> Result<(), AuthenticationError> {
        let requested = request.query("lang").or_else(|| {
            request
                .header("accept-language")
                .and_then(|value| value.split(',').next())
                .and_then(|tag| tag.split(';').next())
        });
        if let Some(tag) = requested.map(str::trim).filter(|tag| !tag.is_empty() && *tag != "*") {
            draft.locale = Some(tag.to_ascii_lowercase());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserAgentStep;

impl ContextStep for UserAgentStep {
    fn name(&self) -> &'static str {
        "user_agent"
    }

    fn apply(
        &self,
        request: &ConnectionRequest,
        draft: &mut ContextDraft,
    ) -> Result<(), AuthenticationError> {
        draft.user_agent = request.header("user-agent").map(str::to_string);
        Ok(())
    }
}

/// Reads the host application's session key from a cookie. The cookie is set
/// by the host, so a page only ever sees its own session.
#[derive(Debug, Clone)]
pub struct SessionStep {
    cookie: String,
}

impl Default for SessionStep {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_COOKIE)
    }
}

impl SessionStep {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
        }
    }
}

impl ContextStep for SessionStep {
    fn name(&self) -> &'static str {
        "session"
    }

    fn apply(
        &self,
        request: &ConnectionRequest,
        draft: &mut ContextDraft,
    ) -> Result<(), AuthenticationError> {
        let Some(cookies) = request.header("cookie") else {
            return Ok(());
        };
        draft.session = cookies
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| name.trim() == self.cookie)
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(())
    }
}
