//! OAuth password-grant bridge. The PostgreSQL clear-text password message
//! carries the credentials; the exchange with the identity provider is done
//! by a host-provided TokenExchanger. The token subject maps to an IRIS
//! username by stripping the domain part and lowercasing; the user must
//! exist in IRIS.

use std::env;
use std::sync::Arc;

use tracing::{debug, info};

use crate::iriswire::auth::{AuthOutcome, AuthRequest, Drive};
use crate::iriswire::config::OauthSettings;
use crate::iriswire::{Error, Result};

const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct OauthToken {
    pub access_token: String,
    pub subject: String,
    pub expires_in_seconds: u64,
}

/// The OAuth client is provided by the embedding runtime; the server never
/// speaks HTTP itself.
pub trait TokenExchanger: Send + Sync {
    /// Resource-owner password grant.
    fn password_grant(
        &self,
        client_id: &str,
        client_secret: &str,
        user: &str,
        password: &str,
    ) -> Result<OauthToken>;

    fn refresh(&self, client_id: &str, client_secret: &str, refresh_token: &str)
        -> Result<OauthToken>;

    /// True if the token is still active at the identity provider.
    fn introspect(&self, client_id: &str, client_secret: &str, token: &str) -> Result<bool>;
}

pub struct OauthBridge {
    exchanger: Arc<dyn TokenExchanger>,
    client_id: String,
    client_secret: String,
}

impl OauthBridge {
    pub fn from_settings(
        settings: &OauthSettings,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Result<Self> {
        let client_id = env::var(&settings.client_id_env).map_err(|_| {
            Error::config(format!(
                "oauth client id env var {} is not set",
                settings.client_id_env
            ))
        })?;
        let client_secret = env::var(&settings.client_secret_env).map_err(|_| {
            Error::config(format!(
                "oauth client secret env var {} is not set",
                settings.client_secret_env
            ))
        })?;
        if client_secret.len() < MIN_SECRET_BYTES {
            return Err(Error::config(format!(
                "oauth client secret must be at least {} bytes",
                MIN_SECRET_BYTES
            )));
        }
        Ok(OauthBridge {
            exchanger,
            client_id,
            client_secret,
        })
    }

    #[cfg(test)]
    pub fn with_credentials(
        exchanger: Arc<dyn TokenExchanger>,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        OauthBridge {
            exchanger,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }

    pub fn refresh(&self, refresh_token: &str) -> Result<OauthToken> {
        self.exchanger
            .refresh(&self.client_id, &self.client_secret, refresh_token)
    }

    pub fn introspect(&self, token: &str) -> Result<bool> {
        self.exchanger
            .introspect(&self.client_id, &self.client_secret, token)
    }
}

pub struct OauthAuth {
    bridge: Arc<OauthBridge>,
    startup_user: String,
}

impl OauthAuth {
    pub fn new(bridge: Arc<OauthBridge>, startup_user: &str) -> Self {
        OauthAuth {
            bridge,
            startup_user: startup_user.to_string(),
        }
    }

    pub fn start(&mut self) -> Drive {
        Drive::Send(AuthRequest::CleartextPassword)
    }

    /// The PasswordMessage body is the NUL-terminated password.
    pub fn drive(&mut self, body: &[u8]) -> Result<Drive> {
        let end = memchr::memchr(0, body).unwrap_or(body.len());
        let password = std::str::from_utf8(&body[..end])?;

        let token = self
            .bridge
            .exchanger
            .password_grant(
                &self.bridge.client_id,
                &self.bridge.client_secret,
                &self.startup_user,
                password,
            )
            .map_err(|e| Error::auth_failed(format!("token exchange failed: {}", e)))?;

        if !self
            .bridge
            .introspect(&token.access_token)
            .map_err(|e| Error::auth_failed(format!("token introspection failed: {}", e)))?
        {
            return Err(Error::auth_failed("token is not active"));
        }

        let user = map_subject(&token.subject);
        debug!(subject = %token.subject, iris_user = %user, "token subject mapped");
        info!(%user, expires_in = token.expires_in_seconds, "oauth authentication succeeded");
        Ok(Drive::Finish {
            outcome: AuthOutcome {
                user,
                session_token: Some(token.access_token),
                verify_exists: true,
            },
            final_message: None,
        })
    }
}

/// `ada@example.com` and `EXAMPLE\ada` both map to the IRIS user `ada`.
fn map_subject(subject: &str) -> String {
    let bare = subject
        .split('@')
        .next()
        .unwrap_or(subject)
        .rsplit('\\')
        .next()
        .unwrap_or(subject);
    bare.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticExchanger {
        subject: String,
        active: bool,
    }

    impl TokenExchanger for StaticExchanger {
        fn password_grant(
            &self,
            _client_id: &str,
            _client_secret: &str,
            _user: &str,
            password: &str,
        ) -> Result<OauthToken> {
            if password != "correct horse" {
                return Err(Error::new("invalid_grant"));
            }
            Ok(OauthToken {
                access_token: "tok".to_string(),
                subject: self.subject.clone(),
                expires_in_seconds: 3600,
            })
        }

        fn refresh(&self, _: &str, _: &str, _: &str) -> Result<OauthToken> {
            Err(Error::new("not used"))
        }

        fn introspect(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Ok(self.active)
        }
    }

    fn bridge(subject: &str, active: bool) -> Arc<OauthBridge> {
        Arc::new(OauthBridge::with_credentials(
            Arc::new(StaticExchanger {
                subject: subject.to_string(),
                active,
            }),
            "client",
            "0123456789abcdef0123456789abcdef",
        ))
    }

    #[test]
    fn test_password_grant_maps_subject() {
        let mut auth = OauthAuth::new(bridge("Ada@example.com", true), "ada");
        assert!(matches!(
            auth.start(),
            Drive::Send(AuthRequest::CleartextPassword)
        ));
        let done = auth.drive(b"correct horse\0").unwrap();
        match done {
            Drive::Finish { outcome, .. } => {
                assert_eq!(outcome.user, "ada");
                assert_eq!(outcome.session_token.as_deref(), Some("tok"));
                assert!(outcome.verify_exists);
            }
            _ => panic!("expected Finish"),
        }
    }

    #[test]
    fn test_bad_password_is_28000() {
        let mut auth = OauthAuth::new(bridge("ada", true), "ada");
        auth.start();
        let err = auth.drive(b"wrong\0").unwrap_err();
        assert_eq!(err.sqlstate(), "28000");
    }

    #[test]
    fn test_inactive_token_is_rejected() {
        let mut auth = OauthAuth::new(bridge("ada", false), "ada");
        auth.start();
        let err = auth.drive(b"correct horse\0").unwrap_err();
        assert_eq!(err.sqlstate(), "28000");
    }
}
