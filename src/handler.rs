//! Our `thrussh::client::Handler` implementation.
//!
//! This is deliberately thin: the default method bodies on
//! `thrussh::client::Handler` (see `thrussh/src/client/mod.rs`) forward
//! every channel-lifecycle callback (`data`, `channel_close`,
//! `window_adjusted`, `exit_status`, ...) into the private `session.channels`
//! table that each live `thrussh::client::Channel` reads from; overriding
//! them here would have to reimplement that private bookkeeping or break
//! every channel the orchestrator holds. So the Session Orchestrator (C8)
//! consumes channel events through `Channel::wait()` directly and this
//! handler only overrides the one callback with no default behavior worth
//! keeping: `check_server_key`, the real seam for the Host-Key Verifier
//! (C5).
//!
//! Grounded on `thrussh/src/client/mod.rs`'s `Handler` trait definition
//! (`FutureBool`/`FutureUnit` = `futures::future::Ready<...>`, per its own
//! doc-example impl) and its default `check_server_key`, which always
//! returns `false` — the "do nothing" base a real client is expected to
//! override.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::{ready, Ready};
use thrussh::client::Session;
use thrussh_keys::key::PublicKey;

use crate::error::Error;
use crate::hostkey_verify::{self, BatchMode, ReadOnly, VerifyOutcome};
use crate::options::Options;
use crate::trust_store::HostKey;

/// Slot the orchestrator reads from once `connect_stream` returns, since
/// `Client` itself is moved into `thrussh::client::connect_stream` and
/// never handed back: spec.md §4.5's `CHANGED`-verdict feature downgrade
/// has to reach the code that builds the auth plan and the forwarding
/// loops in `session.rs`, not just sit inside this handler.
pub type VerifyResultSlot = Arc<Mutex<Option<VerifyOutcome>>>;

pub struct ClientHandlerError(pub Error);

impl From<thrussh::Error> for ClientHandlerError {
    fn from(e: thrussh::Error) -> Self {
        ClientHandlerError(Error::Ssh(e))
    }
}

/// The per-connection handler state. Everything it needs to reach a
/// verdict on a presented host key; channel bookkeeping itself lives in
/// `channel::Multiplexer`, driven directly by `session.rs` rather than by
/// snooping these callbacks.
pub struct Client {
    pub options: Options,
    pub resolved_addr: Option<IpAddr>,
    pub user_known_hosts: PathBuf,
    pub system_known_hosts: PathBuf,
    pub read_only: ReadOnly,
    pub verify_result: VerifyResultSlot,
}

impl thrussh::client::Handler for Client {
    type Error = ClientHandlerError;
    type FutureBool = Ready<Result<(Self, bool), Self::Error>>;
    type FutureUnit = Ready<Result<(Self, Session), Self::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        ready(Ok((self, b)))
    }

    fn finished(self, session: Session) -> Self::FutureUnit {
        ready(Ok((self, session)))
    }

    /// The Host-Key Verifier integration point (C5). `hostkey_verify`
    /// does its own synchronous filesystem I/O and (outside batch mode)
    /// a synchronous terminal prompt, matching spec.md §4.5/§5's "explicit
    /// synchronous block, not interleaved with channel I/O".
    fn check_server_key(self, server_public_key: &PublicKey) -> Self::FutureBool {
        let presented = HostKey::from_thrussh(server_public_key);
        let mut reader: Box<dyn hostkey_verify::PromptReader> = if self.options.batch_mode {
            Box::new(BatchMode)
        } else {
            Box::new(hostkey_verify::Stdin)
        };
        let outcome = hostkey_verify::verify(
            &self.options,
            self.resolved_addr,
            &presented,
            &self.user_known_hosts,
            &self.system_known_hosts,
            self.read_only,
            reader.as_mut(),
        );
        let accepted = matches!(outcome, Ok(ref o) if o.accepted);
        if let Ok(o) = outcome {
            if let Ok(mut slot) = self.verify_result.lock() {
                *slot = Some(o);
            }
        }
        self.finished_bool(accepted)
    }
}
