//! GSSAPI/Kerberos authentication. Context establishment is delegated to a
//! host-provided SecurityContext (backed by the system GSSAPI library in
//! production); this module drives the PostgreSQL message flow around it
//! and maps the authenticated principal to an IRIS username.

use std::sync::Arc;

use tracing::{debug, info};

use crate::iriswire::auth::{AuthOutcome, AuthRequest, Drive};
use crate::iriswire::{Error, Result};

pub enum GssStep {
    /// Send this token to the peer and wait for its next token.
    Continue(Vec<u8>),
    /// Context is established for the given principal (`user@REALM`).
    Complete { principal: String },
    /// Context established with a final token to deliver first.
    CompleteWithToken {
        token: Vec<u8>,
        principal: String,
    },
}

pub trait SecurityContext: Send {
    fn step(&mut self, token: &[u8]) -> Result<GssStep>;
}

pub trait SecurityContextFactory: Send + Sync {
    fn accept_context(&self) -> Result<Box<dyn SecurityContext>>;
}

pub struct GssAuth {
    context: Box<dyn SecurityContext>,
}

impl GssAuth {
    pub fn new(factory: &Arc<dyn SecurityContextFactory>) -> Result<Self> {
        Ok(GssAuth {
            context: factory.accept_context()?,
        })
    }

    pub fn start(&mut self) -> Drive {
        Drive::Send(AuthRequest::Gss)
    }

    /// Each GSSResponse body is one raw GSSAPI token.
    pub fn drive(&mut self, body: &[u8]) -> Result<Drive> {
        match self.context.step(body)? {
            GssStep::Continue(token) => Ok(Drive::Send(AuthRequest::GssContinue(token))),
            GssStep::Complete { principal } => finish(&principal),
            // the final token and AuthenticationOk go out together
            GssStep::CompleteWithToken { token, principal } => finish_with_token(&principal, token),
        }
    }
}

fn finish(principal: &str) -> Result<Drive> {
    Ok(Drive::Finish {
        outcome: outcome_for(principal)?,
        final_message: None,
    })
}

fn finish_with_token(principal: &str, token: Vec<u8>) -> Result<Drive> {
    Ok(Drive::Finish {
        outcome: outcome_for(principal)?,
        final_message: Some(AuthRequest::GssContinue(token)),
    })
}

fn outcome_for(principal: &str) -> Result<AuthOutcome> {
    let user = map_principal(principal)?;
    debug!(%principal, iris_user = %user, "kerberos principal mapped");
    info!(%user, "gssapi authentication succeeded");
    Ok(AuthOutcome {
        user,
        session_token: None,
        verify_exists: true,
    })
}

/// `ada@EXAMPLE.COM` maps to the IRIS user `ADA`: realm stripped,
/// uppercased by default.
fn map_principal(principal: &str) -> Result<String> {
    let bare = principal.split('@').next().unwrap_or_default();
    if bare.is_empty() {
        return Err(Error::auth_failed(format!(
            "cannot map kerberos principal: {}",
            principal
        )));
    }
    Ok(bare.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedContext {
        rounds: usize,
        principal: &'static str,
    }

    impl SecurityContext for ScriptedContext {
        fn step(&mut self, _token: &[u8]) -> Result<GssStep> {
            if self.rounds > 0 {
                self.rounds -= 1;
                return Ok(GssStep::Continue(b"challenge".to_vec()));
            }
            Ok(GssStep::Complete {
                principal: self.principal.to_string(),
            })
        }
    }

    struct ScriptedFactory;

    impl SecurityContextFactory for ScriptedFactory {
        fn accept_context(&self) -> Result<Box<dyn SecurityContext>> {
            Ok(Box::new(ScriptedContext {
                rounds: 2,
                principal: "ada@EXAMPLE.COM",
            }))
        }
    }

    #[test]
    fn test_multi_step_context_establishment() {
        let factory: Arc<dyn SecurityContextFactory> = Arc::new(ScriptedFactory);
        let mut auth = GssAuth::new(&factory).unwrap();
        assert!(matches!(auth.start(), Drive::Send(AuthRequest::Gss)));

        let step1 = auth.drive(b"tok1").unwrap();
        assert!(matches!(step1, Drive::Send(AuthRequest::GssContinue(_))));
        let step2 = auth.drive(b"tok2").unwrap();
        assert!(matches!(step2, Drive::Send(AuthRequest::GssContinue(_))));

        match auth.drive(b"tok3").unwrap() {
            Drive::Finish { outcome, .. } => {
                assert_eq!(outcome.user, "ADA");
                assert!(outcome.verify_exists);
            }
            _ => panic!("expected Finish"),
        }
    }

    #[test]
    fn test_principal_mapping() {
        assert_eq!(map_principal("bob@REALM.ORG").unwrap(), "BOB");
        assert!(map_principal("@REALM.ORG").is_err());
    }
}
