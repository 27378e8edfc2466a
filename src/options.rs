//! The fully-resolved, immutable-after-init configuration record.
//!
//! `Options` is produced once (by `cli::parse` in this binary, or by an
//! embedding application) and threaded by reference through every
//! component from there on. The one legal "mutation" is the host-key
//! `CHANGED` feature-downgrade response, which is expressed as a new,
//! adjusted `Options` value rather than an in-place write — see
//! `hostkey_verify::downgrade`.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolMask {
    pub v1: bool,
    pub v2: bool,
    pub prefer_v1: bool,
}

impl Default for ProtocolMask {
    fn default() -> Self {
        ProtocolMask {
            v1: false,
            v2: true,
            prefer_v1: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Any,
    Inet4,
    Inet6,
}

impl Default for AddressFamily {
    fn default() -> Self {
        AddressFamily::Any
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrictHostKeyChecking {
    Off,
    Ask,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyHostKeyDns {
    Off,
    Soft,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMaster {
    No,
    Yes,
    Ask,
    Auto,
}

impl Default for ControlMaster {
    fn default() -> Self {
        ControlMaster::No
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunMode {
    Off,
    PointToPoint,
    Ethernet,
}

impl Default for TunMode {
    fn default() -> Self {
        TunMode::Off
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDirection {
    Local,
    Remote,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub listen_host: Option<String>,
    pub listen_port: u16,
    pub connect_host: String,
    pub connect_port: u16,
    pub direction: ForwardDirection,
}

/// Models the `options.ciphers = (char *)-1` sentinel from the original
/// source (see DESIGN.md, Open Question 3) as an explicit variant rather
/// than a magic pointer value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherSpec {
    Default,
    List(Vec<String>),
    Unsupported,
}

impl Default for CipherSpec {
    fn default() -> Self {
        CipherSpec::Default
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub protocol_mask: ProtocolMask,
    pub address_family: AddressFamily,

    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub host_key_alias: Option<String>,
    pub bind_address: Option<String>,

    pub connection_attempts: u32,
    pub connection_timeout_ms: u64,
    pub tcp_keep_alive: bool,

    pub proxy_command: Option<String>,

    pub check_host_ip: bool,
    pub strict_host_key_checking: StrictHostKeyChecking,
    pub verify_host_key_dns: VerifyHostKeyDns,
    pub hash_known_hosts: bool,
    pub no_host_authentication_for_localhost: bool,
    pub visual_host_key: bool,

    pub known_hosts_user: PathBuf,
    pub known_hosts_system: PathBuf,
    pub known_hosts_user_v1: Option<PathBuf>,
    pub known_hosts_system_v1: Option<PathBuf>,

    pub identity_files: Vec<PathBuf>,
    pub smartcard_device: Option<String>,

    pub forward_agent: bool,
    pub forward_x11: bool,
    pub forward_x11_trusted: bool,
    pub gateway_ports: bool,
    pub exit_on_forward_failure: bool,

    pub local_forwards: Vec<ForwardSpec>,
    pub remote_forwards: Vec<ForwardSpec>,

    pub tun_mode: TunMode,
    pub tun_local: Option<u32>,
    pub tun_remote: Option<u32>,

    pub compression: bool,
    pub compression_level: u8,

    pub obfuscation: bool,
    pub obfuscation_keyword: Option<String>,

    pub control_master: ControlMaster,
    pub control_path: Option<PathBuf>,

    pub escape_char: Option<char>,
    pub batch_mode: bool,
    pub permit_local_command: bool,
    pub local_command: Option<String>,

    pub ciphers: CipherSpec,
    pub macs: Option<Vec<String>>,

    pub want_tty: Option<bool>,
    pub no_remote_command: bool,
    pub stdin_from_devnull: bool,
    pub fork_after_authentication: bool,
    pub subsystem: Option<String>,
    pub remote_command: Vec<String>,
    pub quiet: bool,
    pub verbosity: u8,
    pub gssapi_delegate_credentials: bool,
}

impl Options {
    /// The canonical trust-store key name for the configured host, per
    /// spec.md §4.5 step 2: the alias if set, else `[host]:port` for a
    /// non-default port, else the bare host name.
    pub fn host_key_name(&self) -> String {
        if let Some(alias) = &self.host_key_alias {
            alias.clone()
        } else if self.port != 22 {
            format!("[{}]:{}", self.host, self.port)
        } else {
            self.host.clone()
        }
    }

    pub fn default_port(&self) -> bool {
        self.port == 22
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            protocol_mask: ProtocolMask::default(),
            address_family: AddressFamily::default(),
            host: String::new(),
            port: 22,
            user: None,
            host_key_alias: None,
            bind_address: None,
            connection_attempts: 1,
            connection_timeout_ms: 0,
            tcp_keep_alive: true,
            proxy_command: None,
            check_host_ip: false,
            strict_host_key_checking: StrictHostKeyChecking::Ask,
            verify_host_key_dns: VerifyHostKeyDns::Off,
            hash_known_hosts: false,
            no_host_authentication_for_localhost: false,
            visual_host_key: false,
            known_hosts_user: PathBuf::new(),
            known_hosts_system: PathBuf::from("/etc/ssh/ssh_known_hosts"),
            known_hosts_user_v1: None,
            known_hosts_system_v1: None,
            identity_files: Vec::new(),
            smartcard_device: None,
            forward_agent: false,
            forward_x11: false,
            forward_x11_trusted: false,
            gateway_ports: false,
            exit_on_forward_failure: false,
            local_forwards: Vec::new(),
            remote_forwards: Vec::new(),
            tun_mode: TunMode::default(),
            tun_local: None,
            tun_remote: None,
            compression: false,
            compression_level: 6,
            obfuscation: false,
            obfuscation_keyword: None,
            control_master: ControlMaster::default(),
            control_path: None,
            escape_char: Some('~'),
            batch_mode: false,
            permit_local_command: false,
            local_command: None,
            ciphers: CipherSpec::default(),
            macs: None,
            want_tty: None,
            no_remote_command: false,
            stdin_from_devnull: false,
            fork_after_authentication: false,
            subsystem: None,
            remote_command: Vec::new(),
            quiet: false,
            verbosity: 0,
            gssapi_delegate_credentials: false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_key_name_default_port_is_bare() {
        let mut o = Options::default();
        o.host = "example.com".into();
        o.port = 22;
        assert_eq!(o.host_key_name(), "example.com");
    }

    #[test]
    fn host_key_name_non_default_port_is_bracketed() {
        let mut o = Options::default();
        o.host = "example.com".into();
        o.port = 2222;
        assert_eq!(o.host_key_name(), "[example.com]:2222");
    }

    #[test]
    fn host_key_name_alias_wins() {
        let mut o = Options::default();
        o.host = "example.com".into();
        o.port = 2222;
        o.host_key_alias = Some("alias.internal".into());
        assert_eq!(o.host_key_name(), "alias.internal");
    }
}
