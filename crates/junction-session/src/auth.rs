//! Verb authorization against a session.
//!
//! Every verb declares an [`AuthRequirement`]. Before the verb runs, the
//! requirement is checked against the request's session and token; on
//! success the post-actions (token renewal, session close) apply after
//! the verb callback returns.

use crate::session::Session;

/// What a verb demands of the session carrying a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuthRequirement {
    /// Require a valid, non-expired token on the request.
    pub check: bool,
    /// Close the session after the verb completes.
    pub close: bool,
    /// Rotate the token after the verb completes.
    pub renew: bool,
    /// Minimum level of assurance, `0` = none.
    pub loa: u8,
}

impl AuthRequirement {
    /// No demand at all.
    pub const NONE: AuthRequirement = AuthRequirement {
        check: false,
        close: false,
        renew: false,
        loa: 0,
    };

    /// Require token authentication.
    pub fn checked() -> AuthRequirement {
        AuthRequirement {
            check: true,
            ..AuthRequirement::NONE
        }
    }

    /// Require token authentication and at least `loa`.
    pub fn with_loa(loa: u8) -> AuthRequirement {
        AuthRequirement {
            check: true,
            loa,
            ..AuthRequirement::NONE
        }
    }

    /// Add token renewal on success.
    pub fn renewing(self) -> AuthRequirement {
        AuthRequirement {
            renew: true,
            ..self
        }
    }

    /// Add session close on success.
    pub fn closing(self) -> AuthRequirement {
        AuthRequirement {
            close: true,
            ..self
        }
    }
}

/// Authorization refusal, surfaced as the reply's error kind.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// Token missing, stale, or the session is gone.
    #[error("invalid-token")]
    InvalidToken,

    /// The session's LOA is below the verb's threshold.
    #[error("insufficient-scope")]
    InsufficientScope,
}

/// Check the requirement before invoking the verb.
///
/// Failures short-circuit: the verb is never invoked.
pub fn precheck(
    session: &Session,
    requirement: AuthRequirement,
    token: Option<&str>,
) -> Result<(), AuthError> {
    if requirement.check {
        if session.is_closed() {
            return Err(AuthError::InvalidToken);
        }
        match token {
            Some(candidate) if session.check_token(candidate) => {}
            _ => return Err(AuthError::InvalidToken),
        }
    }
    if requirement.loa > 0 && session.loa() < requirement.loa {
        return Err(AuthError::InsufficientScope);
    }
    Ok(())
}

/// Apply the requirement's post-actions after a successful verb.
pub fn postprocess(session: &Session, requirement: AuthRequirement) {
    if requirement.renew {
        let _ = session.renew_token();
    }
    if requirement.close {
        session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const TOKEN: &str = "123456789012345678901234567890123456";

    fn session() -> Session {
        Session::new(
            uuid::Uuid::new_v4().to_string(),
            TOKEN.to_owned(),
            Duration::hours(1),
        )
    }

    #[test]
    fn none_accepts_anything() {
        let s = session();
        assert_eq!(precheck(&s, AuthRequirement::NONE, None), Ok(()));
        assert_eq!(precheck(&s, AuthRequirement::NONE, Some("junk")), Ok(()));
    }

    #[test]
    fn check_requires_the_current_token() {
        let s = session();
        assert_eq!(
            precheck(&s, AuthRequirement::checked(), None),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            precheck(&s, AuthRequirement::checked(), Some("wrong")),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(precheck(&s, AuthRequirement::checked(), Some(TOKEN)), Ok(()));

        let renewed = s.renew_token();
        assert_eq!(
            precheck(&s, AuthRequirement::checked(), Some(TOKEN)),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            precheck(&s, AuthRequirement::checked(), Some(&renewed)),
            Ok(())
        );
    }

    #[test]
    fn closed_session_fails_the_check() {
        let s = session();
        s.close();
        assert_eq!(
            precheck(&s, AuthRequirement::checked(), Some(TOKEN)),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn loa_is_a_minimum_threshold() {
        let s = session();
        s.set_loa(2).unwrap();
        assert_eq!(precheck(&s, AuthRequirement::with_loa(1), Some(TOKEN)), Ok(()));
        assert_eq!(precheck(&s, AuthRequirement::with_loa(2), Some(TOKEN)), Ok(()));
        assert_eq!(
            precheck(&s, AuthRequirement::with_loa(3), Some(TOKEN)),
            Err(AuthError::InsufficientScope)
        );
    }

    #[test]
    fn post_actions_renew_and_close() {
        let s = session();
        postprocess(&s, AuthRequirement::checked().renewing());
        assert!(!s.check_token(TOKEN));
        assert!(!s.is_closed());

        postprocess(&s, AuthRequirement::checked().closing());
        assert!(s.is_closed());
    }
}
