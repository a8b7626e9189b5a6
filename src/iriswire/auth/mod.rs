mod gssapi;
mod oauth;
mod scram;

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::iriswire::config::{AuthMode, AuthSettings};
use crate::iriswire::{Error, Result};

pub use self::gssapi::{GssAuth, GssStep, SecurityContext, SecurityContextFactory};
pub use self::oauth::{OauthAuth, OauthBridge, OauthToken, TokenExchanger};
pub use self::scram::{CredentialStore, ScramCredential, ScramServer, MIN_ITERATIONS, SCRAM_SHA_256};

/// Every authentication path must finish within this window.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// What the connection handler should send to the client next.
#[derive(Debug)]
pub enum AuthRequest {
    /// AuthenticationSASL with the advertised mechanisms.
    SaslMechanisms(Vec<&'static str>),
    /// AuthenticationSASLContinue carrying SASL data.
    SaslContinue(Vec<u8>),
    /// AuthenticationSASLFinal carrying SASL data.
    SaslFinal(Vec<u8>),
    /// AuthenticationCleartextPassword.
    CleartextPassword,
    /// AuthenticationGSS.
    Gss,
    /// AuthenticationGSSContinue carrying a GSSAPI token.
    GssContinue(Vec<u8>),
}

#[derive(Debug)]
pub struct AuthOutcome {
    pub user: String,
    pub session_token: Option<String>,
    /// The handler must confirm the user exists in IRIS before completing
    /// startup (oauth and gssapi paths).
    pub verify_exists: bool,
}

#[derive(Debug)]
pub enum Drive {
    /// Send the request and wait for the client's next message.
    Send(AuthRequest),
    /// Authentication finished; `final_message` (if any) precedes
    /// AuthenticationOk on the wire.
    Finish {
        outcome: AuthOutcome,
        final_message: Option<AuthRequest>,
    },
}

/// Construction-time authentication dependencies shared by all
/// connections. The OAuth exchanger and GSSAPI context factory are
/// injected by the embedding host.
pub struct AuthConfig {
    mode: AuthMode,
    credentials: Arc<CredentialStore>,
    oauth: Option<Arc<OauthBridge>>,
    gssapi: Option<Arc<dyn SecurityContextFactory>>,
}

impl AuthConfig {
    pub fn from_settings(
        settings: &AuthSettings,
        exchanger: Option<Arc<dyn TokenExchanger>>,
        gssapi: Option<Arc<dyn SecurityContextFactory>>,
    ) -> Result<Self> {
        let credentials = Arc::new(CredentialStore::from_passwords(&settings.users));
        let oauth = match settings.mode {
            AuthMode::Oauth => {
                let oauth_settings = settings
                    .oauth
                    .as_ref()
                    .ok_or_else(|| Error::config("auth mode oauth requires an oauth section"))?;
                let exchanger = exchanger.ok_or_else(|| {
                    Error::config("auth mode oauth requires a TokenExchanger from the host")
                })?;
                Some(Arc::new(OauthBridge::from_settings(
                    oauth_settings,
                    exchanger,
                )?))
            }
            _ => None,
        };
        if settings.mode == AuthMode::Gssapi && gssapi.is_none() {
            return Err(Error::config(
                "auth mode gssapi requires a SecurityContextFactory from the host",
            ));
        }
        Ok(AuthConfig {
            mode: settings.mode,
            credentials,
            oauth,
            gssapi,
        })
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn authenticator(&self, startup_user: &str) -> Result<Authenticator> {
        match self.mode {
            AuthMode::Trust => Ok(Authenticator::Trust(Some(startup_user.to_string()))),
            AuthMode::Scram => Ok(Authenticator::Scram(ScramServer::new(
                self.credentials.clone(),
                startup_user,
            ))),
            AuthMode::Oauth => {
                let bridge = self
                    .oauth
                    .as_ref()
                    .ok_or_else(|| Error::config("oauth bridge not configured"))?;
                Ok(Authenticator::Oauth(OauthAuth::new(
                    bridge.clone(),
                    startup_user,
                )))
            }
            AuthMode::Gssapi => {
                let factory = self
                    .gssapi
                    .as_ref()
                    .ok_or_else(|| Error::config("gssapi factory not configured"))?;
                Ok(Authenticator::Gssapi(GssAuth::new(factory)?))
            }
        }
    }
}

/// Per-connection authentication state machine, one variant active per
/// server instance.
pub enum Authenticator {
    Trust(Option<String>),
    Scram(ScramServer),
    Oauth(OauthAuth),
    Gssapi(GssAuth),
}

impl Authenticator {
    pub fn start(&mut self) -> Result<Drive> {
        match self {
            Authenticator::Trust(user) => {
                let user = user.take().ok_or_else(|| {
                    Error::protocol_error("trust authentication already finished")
                })?;
                warn!(%user, "trust authentication accepted without credentials");
                Ok(Drive::Finish {
                    outcome: AuthOutcome {
                        user,
                        session_token: None,
                        verify_exists: false,
                    },
                    final_message: None,
                })
            }
            Authenticator::Scram(scram) => Ok(scram.start()),
            Authenticator::Oauth(oauth) => Ok(oauth.start()),
            Authenticator::Gssapi(gss) => Ok(gss.start()),
        }
    }

    /// Feed the body of the client's next password/SASL/GSS message.
    pub fn drive(&mut self, body: &[u8]) -> Result<Drive> {
        match self {
            Authenticator::Trust(_) => {
                Err(Error::protocol_error("unexpected message during trust authentication"))
            }
            Authenticator::Scram(scram) => scram.drive(body),
            Authenticator::Oauth(oauth) => oauth.drive(body),
            Authenticator::Gssapi(gss) => gss.drive(body),
        }
    }
}
