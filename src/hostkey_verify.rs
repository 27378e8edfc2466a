//! Host-Key Verifier (C5): applies trust policy to a presented host key,
//! drives user prompts, and computes the feature-downgrade response to a
//! changed key.
//!
//! Grounded almost verbatim on `examples/original_source/sshconnect.c`'s
//! `check_host_key`, `verify_host_key`, and `warn_changed_key` for the
//! algorithm, decision table, and banner text; `show_other_keys` grounds
//! the "different key type already known" diagnostic folded into the
//! `Ask` prompt text.

use std::net::IpAddr;
use std::path::Path;

use log::warn;

use crate::options::{Options, StrictHostKeyChecking};
use crate::trust_store::{self, HostKey, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOnly {
    Rw,
    Ro,
    RoQuiet,
}

/// The pure, three-way reduction spec.md §8 requires: every
/// `(host_status, ip_status, strict, readonly, is_local, alias_set)`
/// tuple maps onto exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Accept,
    Prompt,
    Reject,
}

/// Pure decision function, kept separate from any I/O so it is directly
/// property-testable per spec.md §8.
pub fn decide(
    host_status: Status,
    ip_status: Option<Status>,
    strict: StrictHostKeyChecking,
    read_only: ReadOnly,
    is_local: bool,
    alias_set: bool,
    no_host_auth_for_localhost: bool,
) -> Category {
    if no_host_auth_for_localhost && !alias_set && is_local {
        return Category::Accept;
    }

    match host_status {
        Status::Revoked => Category::Reject,
        Status::Ok => {
            // ip_status mismatches are handled as a post-check warning
            // (spec.md §4.5 step 5), never changing the accept verdict
            // on their own except that strict mode treats a CHANGED ip
            // as a rejection.
            if ip_status == Some(Status::Changed) && strict == StrictHostKeyChecking::Strict {
                Category::Reject
            } else {
                Category::Accept
            }
        }
        Status::New => match strict {
            StrictHostKeyChecking::Strict => Category::Reject,
            _ if read_only != ReadOnly::Rw => Category::Reject,
            StrictHostKeyChecking::Ask => Category::Prompt,
            StrictHostKeyChecking::Off => Category::Accept,
        },
        Status::Changed => match strict {
            StrictHostKeyChecking::Strict => Category::Reject,
            _ => Category::Accept, // accept but triggers feature downgrade; see `downgrade`
        },
    }
}

#[derive(Debug, Clone)]
pub struct FeatureDowngrade {
    pub password_auth: bool,
    pub keyboard_interactive: bool,
    pub challenge_response: bool,
    pub forward_agent: bool,
    pub forward_x11: bool,
    pub local_forwards_cleared: bool,
    pub remote_forwards_cleared: bool,
    pub tun_mode_disabled: bool,
}

/// The fixed MITM warning banner, verbatim from `warn_changed_key` /
/// `check_host_key`'s `HOST_CHANGED` branch.
pub const MITM_BANNER: &str = "\
@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@
@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @
@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@
IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!
Someone could be eavesdropping on you right now (man-in-the-middle attack)!
It is also possible that a host key has just been changed.";

/// Given the live `Options`, produce the adjusted, feature-downgraded
/// record spec.md §9's "Global mutable Options" design note calls for:
/// a new value, never an in-place mutation. Applied on a `CHANGED`
/// verdict outside strict mode.
pub fn downgrade(options: &Options) -> (Options, FeatureDowngrade) {
    let mut adjusted = options.clone();
    let record = FeatureDowngrade {
        password_auth: true,
        keyboard_interactive: true,
        challenge_response: true,
        forward_agent: adjusted.forward_agent,
        forward_x11: adjusted.forward_x11,
        local_forwards_cleared: !adjusted.local_forwards.is_empty(),
        remote_forwards_cleared: !adjusted.remote_forwards.is_empty(),
        tun_mode_disabled: adjusted.tun_mode != crate::options::TunMode::Off,
    };
    adjusted.forward_agent = false;
    adjusted.forward_x11 = false;
    adjusted.local_forwards.clear();
    adjusted.remote_forwards.clear();
    adjusted.tun_mode = crate::options::TunMode::Off;
    (adjusted, record)
}

/// A single synchronous yes/no reader over the controlling terminal.
/// `batch_mode` answers every prompt "no" without reading, per spec.md
/// §4.5. Kept as a trait so tests can substitute a scripted answer.
pub trait PromptReader {
    fn ask(&mut self, prompt: &str) -> bool;
}

pub struct BatchMode;
impl PromptReader for BatchMode {
    fn ask(&mut self, _prompt: &str) -> bool {
        false
    }
}

pub struct Stdin;
impl PromptReader for Stdin {
    fn ask(&mut self, prompt: &str) -> bool {
        use std::io::Write;
        loop {
            print!("{} ", prompt);
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            let answer = line.trim().to_lowercase();
            if "yes".starts_with(&answer) && !answer.is_empty() {
                return true;
            }
            if "no".starts_with(&answer) && !answer.is_empty() {
                return false;
            }
        }
    }
}

pub struct VerifyOutcome {
    pub accepted: bool,
    pub downgrade: Option<FeatureDowngrade>,
    /// `Some` only when `downgrade` fired: the adjusted `Options` the
    /// orchestrator must actually authenticate and open forwards with
    /// (spec.md §9's "returned adjusted options record, not in-place
    /// mutation"). `None` means the caller should keep using its own
    /// `Options` unchanged.
    pub adjusted_options: Option<Options>,
}

/// Whether any of the features a `CHANGED` verdict would disable are
/// actually configured. Used to implement spec.md §4.5's "if
/// exit_on_forward_failure and any of those [forwards/tun] were
/// enabled, reject" instead of silently downgrading.
fn has_forwarding_enabled(options: &Options) -> bool {
    options.forward_agent
        || options.forward_x11
        || !options.local_forwards.is_empty()
        || !options.remote_forwards.is_empty()
        || options.tun_mode != crate::options::TunMode::Off
}

/// Full verification: store lookups, decision, prompt (if reached),
/// insertion on a fresh accept, and the post-check ip/host mismatch
/// warning. This is the orchestration layer around `decide`.
#[allow(clippy::too_many_arguments)]
pub fn verify(
    options: &Options,
    resolved_addr: Option<IpAddr>,
    presented_key: &HostKey,
    user_known_hosts: &Path,
    system_known_hosts: &Path,
    read_only: ReadOnly,
    prompt: &mut dyn PromptReader,
) -> crate::error::Result<VerifyOutcome> {
    let is_local = resolved_addr.map(|a| a.is_loopback()).unwrap_or(false);
    let alias_set = options.host_key_alias.is_some();

    let host_key_name = options.host_key_name();
    let (mut host_status, _) = lookup_either(user_known_hosts, system_known_hosts, &host_key_name, presented_key)?;

    // spec.md §4.5 step 4 NEW case: retry under the bare hostname if we
    // were only probed under the bracketed non-default-port form.
    let mut retried = false;
    if host_status == Status::New && !options.default_port() && !alias_set {
        let (bare_status, _) = lookup_either(user_known_hosts, system_known_hosts, &options.host, presented_key)?;
        if bare_status == Status::Ok {
            host_status = Status::Ok;
            retried = true;
        }
    }
    let _ = retried;

    let ip_status = if options.check_host_ip {
        if let Some(addr) = resolved_addr {
            let ip_name = format!("[{}]:{}", addr, options.port);
            let (status, _) = lookup_either(user_known_hosts, system_known_hosts, &ip_name, presented_key)?;
            Some(status)
        } else {
            None
        }
    } else {
        None
    };

    let category = decide(
        host_status,
        ip_status,
        options.strict_host_key_checking,
        read_only,
        is_local,
        alias_set,
        options.no_host_authentication_for_localhost,
    );

    let accepted = match category {
        Category::Accept => true,
        Category::Reject => false,
        Category::Prompt => {
            let other = trust_store::lookup_any(user_known_hosts, &host_key_name, &presented_key.algorithm)?;
            let mut text = format!(
                "The authenticity of host '{}' can't be established.\nFingerprint: {}.",
                options.host,
                fingerprint(presented_key)
            );
            if other.is_none() {
                text.push_str("\nNo other keys of a different type are known for this host.");
            }
            text.push_str("\nAre you sure you want to continue connecting (yes/no)?");
            prompt.ask(&text)
        }
    };

    if host_status == Status::Changed {
        warn!("{}", MITM_BANNER);
    }
    if let Some(Status::Changed) = ip_status {
        warn!("Warning: the ECDSA host key for {} has changed", options.host);
    }

    // spec.md §4.5 CHANGED branch, final clause: a non-strict CHANGED
    // would otherwise downgrade silently; if the caller asked to treat
    // forwarding failures as fatal and actually has forwarding
    // configured, reject instead of downgrading.
    let accepted = if accepted
        && host_status == Status::Changed
        && options.exit_on_forward_failure
        && has_forwarding_enabled(options)
    {
        warn!(
            "rejecting changed host key for {}: ExitOnForwardFailure is set and forwarding is configured",
            options.host
        );
        false
    } else {
        accepted
    };

    if accepted && host_status != Status::Ok && read_only == ReadOnly::Rw {
        trust_store::insert(user_known_hosts, &host_key_name, presented_key, options.hash_known_hosts)?;
        if options.check_host_ip {
            if let Some(addr) = resolved_addr {
                let ip_name = format!("[{}]:{}", addr, options.port);
                trust_store::insert(user_known_hosts, &ip_name, presented_key, options.hash_known_hosts)?;
            }
        }
    }

    let (adjusted_options, downgrade_record) = if accepted && host_status == Status::Changed {
        let (adjusted, record) = downgrade(options);
        (Some(adjusted), Some(record))
    } else {
        (None, None)
    };

    Ok(VerifyOutcome {
        accepted,
        downgrade: downgrade_record,
        adjusted_options,
    })
}

fn lookup_either(
    user_file: &Path,
    system_file: &Path,
    name: &str,
    key: &HostKey,
) -> crate::error::Result<(Status, Option<trust_store::MatchedRecord>)> {
    let (status, record) = trust_store::lookup(user_file, name, key)?;
    if status != Status::New {
        return Ok((status, record));
    }
    trust_store::lookup(system_file, name, key)
}

fn fingerprint(key: &HostKey) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(&key.blob);
    let digest = hasher.finalize();
    let encoded = data_encoding::BASE64_NOPAD.encode(&digest);
    format!("{} {}", key.algorithm, encoded)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ok_accepts() {
        assert_eq!(
            decide(Status::Ok, None, StrictHostKeyChecking::Strict, ReadOnly::Rw, false, false, false),
            Category::Accept
        );
    }

    #[test]
    fn revoked_always_rejects() {
        for strict in [
            StrictHostKeyChecking::Off,
            StrictHostKeyChecking::Ask,
            StrictHostKeyChecking::Strict,
        ] {
            assert_eq!(
                decide(Status::Revoked, None, strict, ReadOnly::Rw, false, false, false),
                Category::Reject
            );
        }
    }

    #[test]
    fn new_strict_rejects_ask_prompts_off_accepts() {
        assert_eq!(
            decide(Status::New, None, StrictHostKeyChecking::Strict, ReadOnly::Rw, false, false, false),
            Category::Reject
        );
        assert_eq!(
            decide(Status::New, None, StrictHostKeyChecking::Ask, ReadOnly::Rw, false, false, false),
            Category::Prompt
        );
        assert_eq!(
            decide(Status::New, None, StrictHostKeyChecking::Off, ReadOnly::Rw, false, false, false),
            Category::Accept
        );
    }

    #[test]
    fn new_read_only_always_rejects() {
        assert_eq!(
            decide(Status::New, None, StrictHostKeyChecking::Off, ReadOnly::Ro, false, false, false),
            Category::Reject
        );
    }

    #[test]
    fn changed_strict_rejects_otherwise_accepts_with_downgrade() {
        assert_eq!(
            decide(Status::Changed, None, StrictHostKeyChecking::Strict, ReadOnly::Rw, false, false, false),
            Category::Reject
        );
        assert_eq!(
            decide(Status::Changed, None, StrictHostKeyChecking::Off, ReadOnly::Rw, false, false, false),
            Category::Accept
        );
    }

    #[test]
    fn localhost_bypass_short_circuits() {
        assert_eq!(
            decide(Status::New, None, StrictHostKeyChecking::Strict, ReadOnly::Rw, true, false, true),
            Category::Accept
        );
    }

    #[test]
    fn localhost_bypass_does_not_apply_with_alias() {
        assert_eq!(
            decide(Status::New, None, StrictHostKeyChecking::Strict, ReadOnly::Rw, true, true, true),
            Category::Reject
        );
    }

    #[test]
    fn downgrade_clears_forwards_and_tun() {
        let mut options = Options::default();
        options.forward_agent = true;
        options.local_forwards.push(crate::options::ForwardSpec {
            listen_host: None,
            listen_port: 8080,
            connect_host: "internal".into(),
            connect_port: 80,
            direction: crate::options::ForwardDirection::Local,
        });
        let (adjusted, record) = downgrade(&options);
        assert!(!adjusted.forward_agent);
        assert!(adjusted.local_forwards.is_empty());
        assert!(record.local_forwards_cleared);
    }

    fn changed_host_options(exit_on_forward_failure: bool) -> Options {
        let mut options = Options::default();
        options.host = "example.com".into();
        options.port = 22;
        options.strict_host_key_checking = StrictHostKeyChecking::Off;
        options.exit_on_forward_failure = exit_on_forward_failure;
        options.forward_agent = true;
        options
    }

    #[test]
    fn changed_with_exit_on_forward_failure_and_forwarding_rejects() {
        let dir = tempdir::TempDir::new("rssh-hostkey-verify").unwrap();
        let user_known_hosts = dir.path().join("known_hosts");
        let system_known_hosts = dir.path().join("ssh_known_hosts");
        let options = changed_host_options(true);
        let old = HostKey::new("ssh-ed25519", vec![1; 32]);
        let new = HostKey::new("ssh-ed25519", vec![2; 32]);
        trust_store::insert(&user_known_hosts, &options.host_key_name(), &old, false).unwrap();

        let mut prompt = BatchMode;
        let outcome = verify(
            &options,
            None,
            &new,
            &user_known_hosts,
            &system_known_hosts,
            ReadOnly::Rw,
            &mut prompt,
        )
        .unwrap();

        assert!(!outcome.accepted);
        assert!(outcome.downgrade.is_none());
        assert!(outcome.adjusted_options.is_none());
    }

    #[test]
    fn changed_without_exit_on_forward_failure_downgrades_and_adjusts() {
        let dir = tempdir::TempDir::new("rssh-hostkey-verify").unwrap();
        let user_known_hosts = dir.path().join("known_hosts");
        let system_known_hosts = dir.path().join("ssh_known_hosts");
        let options = changed_host_options(false);
        let old = HostKey::new("ssh-ed25519", vec![1; 32]);
        let new = HostKey::new("ssh-ed25519", vec![2; 32]);
        trust_store::insert(&user_known_hosts, &options.host_key_name(), &old, false).unwrap();

        let mut prompt = BatchMode;
        let outcome = verify(
            &options,
            None,
            &new,
            &user_known_hosts,
            &system_known_hosts,
            ReadOnly::Rw,
            &mut prompt,
        )
        .unwrap();

        assert!(outcome.accepted);
        assert!(outcome.downgrade.is_some());
        let adjusted = outcome.adjusted_options.unwrap();
        assert!(!adjusted.forward_agent);
    }

    #[test]
    fn changed_with_exit_on_forward_failure_but_no_forwarding_downgrades() {
        let dir = tempdir::TempDir::new("rssh-hostkey-verify").unwrap();
        let user_known_hosts = dir.path().join("known_hosts");
        let system_known_hosts = dir.path().join("ssh_known_hosts");
        let mut options = changed_host_options(true);
        options.forward_agent = false;
        let old = HostKey::new("ssh-ed25519", vec![1; 32]);
        let new = HostKey::new("ssh-ed25519", vec![2; 32]);
        trust_store::insert(&user_known_hosts, &options.host_key_name(), &old, false).unwrap();

        let mut prompt = BatchMode;
        let outcome = verify(
            &options,
            None,
            &new,
            &user_known_hosts,
            &system_known_hosts,
            ReadOnly::Rw,
            &mut prompt,
        )
        .unwrap();

        assert!(outcome.accepted);
        assert!(outcome.downgrade.is_some());
    }
}
