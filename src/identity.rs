//! Identity Loader (C3): expands configured identity paths and eagerly
//! loads the public half of each; the private half is supplied lazily by
//! the authenticator (spec.md §4.3).

use std::path::{Path, PathBuf};

use log::{debug, warn};
use thrussh_keys::key::PublicKey;

use crate::error::{Error, Result};
use crate::options::Options;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    File,
    Smartcard,
    Agent,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub path: PathBuf,
    pub public_key: Option<PublicKey>,
    pub source: IdentitySource,
}

/// Expand `~` and the `%u`/`%h`/`%r`/`%l`/`%d` tokens in an identity-file
/// path, mirroring `sshconnect.c`'s `tilde_expand_filename` +
/// `percent_expand` pipeline. `%l` is the local host name, `%d` the home
/// directory, `%r` the remote login name, `%u` the local user name, `%h`
/// the remote host name.
pub fn expand_path(
    raw: &str,
    home_dir: &str,
    local_user: &str,
    remote_user: &str,
    remote_host: &str,
    local_host: &str,
) -> PathBuf {
    let tilde_expanded = if let Some(rest) = raw.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') {
            format!("{}{}", home_dir, rest)
        } else {
            raw.to_string()
        }
    } else {
        raw.to_string()
    };

    let mut out = String::with_capacity(tilde_expanded.len());
    let mut chars = tilde_expanded.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.next() {
                Some('u') => out.push_str(local_user),
                Some('h') => out.push_str(remote_host),
                Some('r') => out.push_str(remote_user),
                Some('l') => out.push_str(local_host),
                Some('d') => out.push_str(home_dir),
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        } else {
            out.push(c);
        }
    }
    PathBuf::from(out)
}

/// Hard cap on smartcard-enumerated keys prepended to the identity list
/// (spec.md §4.3 step 1: "bounded by a hard cap").
pub const SMARTCARD_KEY_CAP: usize = 8;

/// Query a configured smartcard device for its resident keys. This crate
/// has no PKCS#11 binding available anywhere in its dependency stack, so
/// the enumeration itself is a narrow, injectable contract rather than a
/// concrete implementation; callers that do not have a smartcard
/// configured never invoke it.
pub trait SmartcardSource {
    fn enumerate(&self, device: &str) -> Result<Vec<PublicKey>>;
}

pub struct NoSmartcard;

impl SmartcardSource for NoSmartcard {
    fn enumerate(&self, device: &str) -> Result<Vec<PublicKey>> {
        Err(Error::configuration(format!(
            "smartcard device {:?} configured but no smartcard backend is available in this build",
            device
        )))
    }
}

/// Load the full, ordered identity list for a connection: smartcard keys
/// first (if configured), then each configured identity file in order.
pub fn load_identities(
    options: &Options,
    home_dir: &str,
    local_user: &str,
    remote_user: &str,
    local_host: &str,
    smartcard: &dyn SmartcardSource,
) -> Result<Vec<Identity>> {
    let mut identities = Vec::new();

    if let Some(device) = &options.smartcard_device {
        let keys = smartcard.enumerate(device)?;
        for key in keys.into_iter().take(SMARTCARD_KEY_CAP) {
            identities.push(Identity {
                path: PathBuf::from(device),
                public_key: Some(key),
                source: IdentitySource::Smartcard,
            });
        }
        if identities.len() >= SMARTCARD_KEY_CAP {
            warn!("smartcard key enumeration truncated at {} keys", SMARTCARD_KEY_CAP);
        }
    }

    for raw in &options.identity_files {
        let expanded = expand_path(
            &raw.to_string_lossy(),
            home_dir,
            local_user,
            remote_user,
            &options.host,
            local_host,
        );
        let public_key = load_public_half(&expanded);
        identities.push(Identity {
            path: expanded,
            public_key,
            source: IdentitySource::File,
        });
    }

    Ok(identities)
}

/// A missing or unparsable `.pub` file is tolerated: authentication may
/// still succeed by querying an agent over the matching private key.
fn load_public_half(private_path: &Path) -> Option<PublicKey> {
    let pub_path = {
        let mut s = private_path.as_os_str().to_os_string();
        s.push(".pub");
        PathBuf::from(s)
    };
    match thrussh_keys::load_public_key(&pub_path) {
        Ok(key) => Some(key),
        Err(e) => {
            debug!("no usable public half at {:?}: {}", pub_path, e);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expands_tilde_and_tokens() {
        let p = expand_path(
            "~/.ssh/id_%h_%r",
            "/home/alice",
            "alice",
            "bob",
            "example.com",
            "laptop",
        );
        assert_eq!(p, PathBuf::from("/home/alice/.ssh/id_example.com_bob"));
    }

    #[test]
    fn leaves_bare_tilde_prefixed_username_untouched() {
        // `~otheruser/...` is not expanded by this component (no passwd
        // lookup available here); only a bare `~` or `~/` is.
        let p = expand_path("~otheruser/key", "/home/alice", "a", "b", "h", "l");
        assert_eq!(p, PathBuf::from("~otheruser/key"));
    }

    struct Empty;
    impl SmartcardSource for Empty {
        fn enumerate(&self, _device: &str) -> Result<Vec<PublicKey>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn load_identities_without_smartcard_or_files_is_empty() {
        let options = Options::default();
        let ids = load_identities(&options, "/home/a", "a", "a", "l", &Empty).unwrap();
        assert!(ids.is_empty());
    }
}
