use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::configuration::types::AuthPolicy;
use crate::error_handling::types::AuthError;

/// Longest credential the decoy will even look at. Anything bigger is a
/// malformed attempt, not a crash.
const MAX_CREDENTIAL_LEN: usize = 1024;

/// Authentication method offered by the attacker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Password,
    PublicKey,
    None,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Password => write!(f, "password"),
            Method::PublicKey => write!(f, "publickey"),
            Method::None => write!(f, "none"),
        }
    }
}

/// Secret material supplied by the attacker. Kept out of operational logs:
/// `Debug` and `Display` never show the wrapped value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Secret(value.into())
    }

    /// Hands the raw material to a caller that is allowed to persist it
    /// (the auth-result event payload). Do not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

/// One evaluated credential attempt, as carried inside auth events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialAttempt {
    pub username: String,
    pub method: Method,
    pub secret: Secret,
    pub accepted: bool,
    /// 1-based index of this attempt within its session.
    pub index: u32,
}

/// Outcome of evaluating one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(AuthError),
    /// Keep the attacker talking: refuse this method but advertise that
    /// another one may work (e.g. push a publickey attempt towards password).
    ChallengeMore,
}

/// Evaluates attacker credentials against the configured decoy policy.
///
/// Evaluation is deterministic for a deterministic input set: the same
/// (attempt index, username, method, credential) always yields the same
/// decision, so retries are each judged on their own.
pub struct Authenticator {
    policy: AuthPolicy,
}

impl Authenticator {
    pub fn new(policy: AuthPolicy) -> Self {
        Self { policy }
    }

    /// Decides whether the given attempt is pretended to succeed.
    ///
    /// Malformed input is itself a `Reject` with a diagnostic code; this
    /// function never fails.
    pub fn evaluate(
        &self,
        attempt_index: u32,
        username: &str,
        method: Method,
        credential: &Secret,
    ) -> Decision {
        if let Some(reason) = malformed(username, credential) {
            debug!("auth attempt {} rejected as malformed: {}", attempt_index, reason);
            return Decision::Reject(AuthError::MalformedCredential(reason));
        }

        match method {
            Method::Password => self.evaluate_password(attempt_index, username, credential),
            // Public keys cannot be spoofed towards the backend, so steer the
            // attacker to password auth instead of accepting.
            Method::PublicKey => Decision::ChallengeMore,
            Method::None => Decision::ChallengeMore,
        }
    }

    fn evaluate_password(
        &self,
        attempt_index: u32,
        username: &str,
        credential: &Secret,
    ) -> Decision {
        match &self.policy {
            AuthPolicy::AcceptAll => Decision::Accept,
            AuthPolicy::Fixed { users } => {
                let hit = users
                    .iter()
                    .any(|u| u.username == username && u.password == credential.expose());
                if hit {
                    Decision::Accept
                } else {
                    Decision::Reject(AuthError::PolicyDenied)
                }
            }
            AuthPolicy::AcceptAfter { attempts } => {
                // Classic honeypot trick: fail the first N-1 attempts so the
                // login "feels" guessed rather than handed out.
                if attempt_index >= *attempts {
                    Decision::Accept
                } else {
                    Decision::Reject(AuthError::PolicyDenied)
                }
            }
        }
    }
}

fn malformed(username: &str, credential: &Secret) -> Option<String> {
    if username.is_empty() {
        return Some("empty username".to_string());
    }
    if username.len() > MAX_CREDENTIAL_LEN {
        return Some(format!("username of {} bytes", username.len()));
    }
    if username.chars().any(|c| c.is_control()) {
        return Some("control characters in username".to_string());
    }
    if credential.expose().len() > MAX_CREDENTIAL_LEN {
        return Some(format!("credential of {} bytes", credential.expose().len()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::FixedUser;

    #[test]
    fn accept_all_accepts_anything() {
        let auth = Authenticator::new(AuthPolicy::AcceptAll);
        let d = auth.evaluate(1, "root", Method::Password, &Secret::new("hunter2"));
        assert_eq!(d, Decision::Accept);
    }

    #[test]
    fn fixed_policy_matches_exact_pairs() {
        let auth = Authenticator::new(AuthPolicy::Fixed {
            users: vec![FixedUser {
                username: "admin".to_string(),
                password: "letmein".to_string(),
            }],
        });
        assert_eq!(
            auth.evaluate(1, "admin", Method::Password, &Secret::new("letmein")),
            Decision::Accept
        );
        assert!(matches!(
            auth.evaluate(2, "admin", Method::Password, &Secret::new("wrong")),
            Decision::Reject(AuthError::PolicyDenied)
        ));
    }

    #[test]
    fn accept_after_rejects_early_attempts() {
        let auth = Authenticator::new(AuthPolicy::AcceptAfter { attempts: 3 });
        for i in 1..3 {
            assert!(matches!(
                auth.evaluate(i, "root", Method::Password, &Secret::new("x")),
                Decision::Reject(_)
            ));
        }
        assert_eq!(
            auth.evaluate(3, "root", Method::Password, &Secret::new("x")),
            Decision::Accept
        );
    }

    #[test]
    fn same_input_same_decision() {
        let auth = Authenticator::new(AuthPolicy::AcceptAfter { attempts: 2 });
        let first = auth.evaluate(1, "root", Method::Password, &Secret::new("pw"));
        let again = auth.evaluate(1, "root", Method::Password, &Secret::new("pw"));
        assert_eq!(first, again);
    }

    #[test]
    fn malformed_input_is_a_reject_not_a_panic() {
        let auth = Authenticator::new(AuthPolicy::AcceptAll);
        assert!(matches!(
            auth.evaluate(1, "", Method::Password, &Secret::new("pw")),
            Decision::Reject(AuthError::MalformedCredential(_))
        ));
        let huge = "a".repeat(4096);
        assert!(matches!(
            auth.evaluate(1, "root", Method::Password, &Secret::new(huge)),
            Decision::Reject(AuthError::MalformedCredential(_))
        ));
    }

    #[test]
    fn publickey_is_steered_to_password() {
        let auth = Authenticator::new(AuthPolicy::AcceptAll);
        assert_eq!(
            auth.evaluate(1, "root", Method::PublicKey, &Secret::new("ssh-ed25519 AAAA")),
            Decision::ChallengeMore
        );
    }

    #[test]
    fn secrets_never_leak_through_debug() {
        let s = Secret::new("supersecret");
        assert_eq!(format!("{:?}", s), "<redacted>");
        assert_eq!(format!("{}", s), "<redacted>");
        assert_eq!(s.expose(), "supersecret");
    }
}
