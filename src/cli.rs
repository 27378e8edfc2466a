//! Command-line surface (spec.md §6): single-letter flags, `-o
//! key=value` option folding, and the `[user@]host [command...]`
//! positional grammar, all merged into a single `Options` record.
//!
//! Grounded on `examples/original_source/ssh.c`'s `main` (the flag
//! table and the `user@host` / trailing-command splitting logic at the
//! end of the `getopt` loop) and on `warpgate-cli/src/main.rs` for the
//! `clap` derive idiom already in this crate's dependency stack.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};
use crate::options::{
    AddressFamily, CipherSpec, ControlMaster, ForwardDirection, ForwardSpec, Options,
    StrictHostKeyChecking, TunMode, VerifyHostKeyDns,
};

/// The maximum number of `-i` flags accepted, mirroring `ssh.c`'s
/// `SSH_MAX_IDENTITY_FILES` fatal-if-exceeded check.
pub const MAX_IDENTITY_FILES: usize = 100;

#[derive(Parser, Debug)]
#[clap(name = "rssh", version, about = "A connection orchestrator for the SSH client protocol.")]
struct Cli {
    #[clap(short = '1')]
    protocol_v1: bool,
    #[clap(short = '2')]
    protocol_v2: bool,
    #[clap(short = '4')]
    ipv4: bool,
    #[clap(short = '6')]
    ipv6: bool,
    #[clap(short = 'A')]
    agent_forward: bool,
    #[clap(short = 'a')]
    no_agent_forward: bool,
    #[clap(short = 'C')]
    compression: bool,
    #[clap(short = 'D')]
    dynamic_forward: Vec<String>,
    #[clap(short = 'e')]
    escape_char: Option<String>,
    #[clap(short = 'F')]
    config_file: Option<String>,
    #[clap(short = 'f')]
    fork_after_auth: bool,
    #[clap(short = 'g')]
    gateway_ports: bool,
    #[clap(short = 'I')]
    smartcard_device: Option<String>,
    #[clap(short = 'i')]
    identity_file: Vec<String>,
    #[clap(short = 'K')]
    gssapi_delegate: bool,
    #[clap(short = 'k')]
    no_gssapi_delegate: bool,
    #[clap(short = 'L')]
    local_forward: Vec<String>,
    #[clap(short = 'l')]
    login_name: Option<String>,
    #[clap(short = 'M', parse(from_occurrences))]
    control_master: u8,
    #[clap(short = 'm')]
    mac_spec: Option<String>,
    #[clap(short = 'N')]
    no_remote_command: bool,
    #[clap(short = 'n')]
    stdin_devnull: bool,
    #[clap(short = 'O')]
    control_command: Option<String>,
    #[clap(short = 'o')]
    option: Vec<String>,
    #[clap(short = 'p')]
    port: Option<u16>,
    #[clap(short = 'q')]
    quiet: bool,
    #[clap(short = 'R')]
    remote_forward: Vec<String>,
    #[clap(short = 'S')]
    control_path: Option<String>,
    #[clap(short = 's')]
    subsystem: bool,
    #[clap(short = 'T')]
    no_pty: bool,
    #[clap(short = 't', parse(from_occurrences))]
    force_pty: u8,
    #[clap(short = 'V')]
    print_version: bool,
    #[clap(short = 'v', parse(from_occurrences))]
    verbosity: u8,
    #[clap(short = 'w')]
    tun_device: Option<String>,
    #[clap(short = 'X')]
    x11_forward: bool,
    #[clap(short = 'x')]
    no_x11_forward: bool,
    #[clap(short = 'Y')]
    x11_trusted: bool,
    #[clap(short = 'y')]
    syslog: bool,
    #[clap(short = 'z')]
    obfuscate: bool,
    #[clap(short = 'Z')]
    obfuscate_keyword: Option<String>,
    #[clap(short = 'b')]
    bind_address: Option<String>,
    #[clap(short = 'c')]
    cipher_spec: Option<String>,

    destination: Option<String>,

    #[clap(trailing_var_arg = true)]
    command: Vec<String>,
}

/// The outcome of parsing: either a fully-resolved `Options` ready for
/// `session::connect_and_run`, or a request to print the version and
/// exit cleanly (`-V`, spec.md §6) without touching the network.
pub enum ParseOutcome {
    Run(Options),
    PrintVersion,
}

/// Parse `argv` (including the program name at index 0, matching
/// `std::env::args()`) into a `ParseOutcome`. Any malformed argument is
/// a configuration error, reported and exited with code 255 before any
/// network activity, per spec.md §7.
pub fn parse_args<I, T>(argv: I) -> Result<ParseOutcome>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(argv).map_err(|e| Error::configuration(e.to_string()))?;

    if cli.print_version {
        return Ok(ParseOutcome::PrintVersion);
    }

    if cli.identity_file.len() > MAX_IDENTITY_FILES {
        return Err(Error::configuration(format!(
            "too many identity files specified (max {})",
            MAX_IDENTITY_FILES
        )));
    }

    let mut options = Options::default();

    options.protocol_mask = match (cli.protocol_v1, cli.protocol_v2) {
        (true, true) => crate::options::ProtocolMask { v1: true, v2: true, prefer_v1: true },
        (true, false) => crate::options::ProtocolMask { v1: true, v2: false, prefer_v1: true },
        (false, true) => crate::options::ProtocolMask { v1: false, v2: true, prefer_v1: false },
        (false, false) => crate::options::ProtocolMask::default(),
    };

    options.address_family = match (cli.ipv4, cli.ipv6) {
        (true, false) => AddressFamily::Inet4,
        (false, true) => AddressFamily::Inet6,
        _ => AddressFamily::Any,
    };

    options.forward_agent = cli.agent_forward || (!cli.no_agent_forward && options.forward_agent);
    options.compression = cli.compression;
    options.gateway_ports = cli.gateway_ports;
    options.smartcard_device = cli.smartcard_device;
    options.gssapi_delegate_credentials = cli.gssapi_delegate && !cli.no_gssapi_delegate;
    options.fork_after_authentication = cli.fork_after_auth;
    options.no_remote_command = cli.no_remote_command || cli.fork_after_auth;
    options.stdin_from_devnull = cli.stdin_devnull || cli.fork_after_auth;
    options.quiet = cli.quiet;
    options.verbosity = cli.verbosity.min(3);
    options.bind_address = cli.bind_address;
    options.forward_x11 = (cli.x11_forward || cli.x11_trusted) && !cli.no_x11_forward;
    options.forward_x11_trusted = cli.x11_trusted;
    options.obfuscation = cli.obfuscate || cli.obfuscate_keyword.is_some();
    options.obfuscation_keyword = cli.obfuscate_keyword;

    options.control_master = match cli.control_master {
        0 => ControlMaster::No,
        1 => ControlMaster::Yes,
        _ => ControlMaster::Ask,
    };
    options.control_path = cli.control_path.map(PathBuf::from);

    if cli.no_pty && cli.force_pty > 0 {
        return Err(Error::configuration("-T and -t are mutually exclusive".into()));
    }
    options.want_tty = if cli.no_pty {
        Some(false)
    } else if cli.force_pty > 0 {
        Some(true)
    } else {
        None
    };

    if let Some(raw) = &cli.escape_char {
        options.escape_char = parse_escape_char(raw)?;
    }

    options.identity_files = cli.identity_file.iter().map(PathBuf::from).collect();

    for raw in &cli.local_forward {
        options.local_forwards.push(parse_forward(raw, ForwardDirection::Local)?);
    }
    for raw in &cli.remote_forward {
        options.remote_forwards.push(parse_forward(raw, ForwardDirection::Remote)?);
    }
    for raw in &cli.dynamic_forward {
        options.local_forwards.push(parse_dynamic_forward(raw)?);
    }

    if let Some(raw) = &cli.tun_device {
        let (local, remote) = parse_tun(raw)?;
        options.tun_mode = TunMode::PointToPoint;
        options.tun_local = Some(local);
        options.tun_remote = remote;
    }

    if let Some(spec) = &cli.cipher_spec {
        options.ciphers = if spec.is_empty() {
            CipherSpec::Unsupported
        } else {
            CipherSpec::List(spec.split(',').map(|s| s.to_string()).collect())
        };
    }
    if let Some(spec) = &cli.mac_spec {
        options.macs = Some(spec.split(',').map(|s| s.to_string()).collect());
    }

    if let Some(p) = cli.port {
        options.port = p;
    }
    options.user = cli.login_name.clone();

    for raw in &cli.option {
        apply_dash_o(&mut options, raw)?;
    }

    let _ = cli.config_file; // the external config loader is out of scope (spec.md §1)
    let _ = cli.control_command; // control-master interaction is out of scope (spec.md §9)
    if cli.syslog {
        log::warn!("-y (syslog) was requested; this build always logs to stderr");
    }
    if cli.subsystem {
        // The subsystem *name* is the first positional command token,
        // matching `ssh.c`'s `-s` handling (it takes no argument of its
        // own; it reinterprets the trailing command as a subsystem name).
    }

    let (user_from_destination, host) = split_destination(
        cli.destination
            .as_deref()
            .ok_or_else(|| Error::configuration("missing required argument: host".to_string()))?,
    )?;
    if options.user.is_none() {
        options.user = user_from_destination;
    }
    options.host = host;

    let mut remote_command = cli.command;
    if cli.subsystem {
        options.subsystem = remote_command.first().cloned();
    } else if !remote_command.is_empty() {
        options.remote_command = std::mem::take(&mut remote_command);
    }

    Ok(ParseOutcome::Run(options))
}

/// Split `[user@]host` into `(user, host)`, per spec.md §6 and §8's
/// round-trip property. A bare `@` with nothing before it is rejected,
/// mirroring `ssh.c`'s `usage()` call on that malformed form.
fn split_destination(raw: &str) -> Result<(Option<String>, String)> {
    match raw.rsplit_once('@') {
        Some(("", _)) => Err(Error::configuration(format!("invalid destination: {:?}", raw))),
        Some((user, host)) => Ok((Some(user.to_string()), host.to_string())),
        None => Ok((None, raw.to_string())),
    }
}

/// `-e char`: a single literal character, `^X` control-character
/// notation, or the literal `none` to disable the escape character.
fn parse_escape_char(raw: &str) -> Result<Option<char>> {
    if raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    if let Some(rest) = raw.strip_prefix('^') {
        let mut chars = rest.chars();
        let c = chars
            .next()
            .ok_or_else(|| Error::configuration("empty ^ escape-character spec".to_string()))?;
        if chars.next().is_some() {
            return Err(Error::configuration(format!("invalid escape character spec: {:?}", raw)));
        }
        let code = (c.to_ascii_uppercase() as u8) & 0x1f;
        return Ok(Some(code as char));
    }
    let mut chars = raw.chars();
    let c = chars
        .next()
        .ok_or_else(|| Error::configuration("empty escape-character spec".to_string()))?;
    if chars.next().is_some() {
        return Err(Error::configuration(format!(
            "escape character must be a single character: {:?}",
            raw
        )));
    }
    Ok(Some(c))
}

/// `[listen_host:]listen_port:connect_host:connect_port`, per spec.md
/// §8 scenario 3.
fn parse_forward(raw: &str, direction: ForwardDirection) -> Result<ForwardSpec> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (listen_host, listen_port, connect_host, connect_port) = match parts.as_slice() {
        [port, host, cport] => (None, *port, *host, *cport),
        [lhost, port, host, cport] => (Some(lhost.to_string()), *port, *host, *cport),
        _ => {
            return Err(Error::configuration(format!(
                "invalid forward specification: {:?}",
                raw
            )))
        }
    };
    Ok(ForwardSpec {
        listen_host,
        listen_port: parse_port(listen_port, raw)?,
        connect_host: connect_host.to_string(),
        connect_port: parse_port(connect_port, raw)?,
        direction,
    })
}

/// `-D [listen_host:]port`: a SOCKS dynamic forward has no connect
/// target, per spec.md §3 (`ForwardSpec` with an empty `connect_host`).
fn parse_dynamic_forward(raw: &str) -> Result<ForwardSpec> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (listen_host, listen_port) = match parts.as_slice() {
        [port] => (None, *port),
        [host, port] => (Some(host.to_string()), *port),
        _ => return Err(Error::configuration(format!("invalid dynamic forward spec: {:?}", raw))),
    };
    Ok(ForwardSpec {
        listen_host,
        listen_port: parse_port(listen_port, raw)?,
        connect_host: String::new(),
        connect_port: 0,
        direction: ForwardDirection::Dynamic,
    })
}

fn parse_port(raw: &str, context: &str) -> Result<u16> {
    raw.parse()
        .map_err(|_| Error::configuration(format!("invalid port in {:?}: {:?}", context, raw)))
}

/// `-w local[:remote]`: tunnel device numbers.
fn parse_tun(raw: &str) -> Result<(u32, Option<u32>)> {
    match raw.split_once(':') {
        Some((local, remote)) => {
            let local = local
                .parse()
                .map_err(|_| Error::configuration(format!("invalid tunnel device: {:?}", raw)))?;
            let remote = remote
                .parse()
                .map_err(|_| Error::configuration(format!("invalid tunnel device: {:?}", raw)))?;
            Ok((local, Some(remote)))
        }
        None => {
            let local = raw
                .parse()
                .map_err(|_| Error::configuration(format!("invalid tunnel device: {:?}", raw)))?;
            Ok((local, None))
        }
    }
}

/// Fold one `-o key=value` pair into `options`, mirroring `ssh.c`'s
/// `process_config_line` for the subset of keys this core actually
/// consumes. An unrecognized key is a configuration error, per spec.md
/// §7 ("bad flag" is reported before any network activity).
fn apply_dash_o(options: &mut Options, raw: &str) -> Result<()> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| Error::configuration(format!("invalid -o argument (expected key=value): {:?}", raw)))?;
    let value = value.trim();
    match key.trim().to_lowercase().as_str() {
        "stricthostkeychecking" => {
            options.strict_host_key_checking = match value.to_lowercase().as_str() {
                "yes" | "strict" => StrictHostKeyChecking::Strict,
                "no" | "off" => StrictHostKeyChecking::Off,
                "ask" => StrictHostKeyChecking::Ask,
                other => return Err(Error::configuration(format!("invalid StrictHostKeyChecking value: {:?}", other))),
            };
        }
        "userknownhostsfile" => options.known_hosts_user = PathBuf::from(value),
        "globalknownhostsfile" => options.known_hosts_system = PathBuf::from(value),
        "hashknownhosts" => options.hash_known_hosts = parse_yes_no(value)?,
        "checkhostip" => options.check_host_ip = parse_yes_no(value)?,
        "verifyhostkeydns" => {
            options.verify_host_key_dns = match value.to_lowercase().as_str() {
                "yes" => VerifyHostKeyDns::Strict,
                "ask" => VerifyHostKeyDns::Soft,
                "no" => VerifyHostKeyDns::Off,
                other => return Err(Error::configuration(format!("invalid VerifyHostKeyDNS value: {:?}", other))),
            };
        }
        "noatauthenticationforlocalhost" | "nohostauthenticationforlocalhost" => {
            options.no_host_authentication_for_localhost = parse_yes_no(value)?;
        }
        "visualhostkey" => options.visual_host_key = parse_yes_no(value)?,
        "compression" => options.compression = parse_yes_no(value)?,
        "compressionlevel" => {
            options.compression_level = value
                .parse()
                .map_err(|_| Error::configuration(format!("invalid CompressionLevel: {:?}", value)))?;
        }
        "connecttimeout" => {
            let secs: u64 = value
                .parse()
                .map_err(|_| Error::configuration(format!("invalid ConnectTimeout: {:?}", value)))?;
            options.connection_timeout_ms = secs.saturating_mul(1000);
        }
        "connectionattempts" => {
            options.connection_attempts = value
                .parse()
                .map_err(|_| Error::configuration(format!("invalid ConnectionAttempts: {:?}", value)))?;
        }
        "batchmode" => options.batch_mode = parse_yes_no(value)?,
        "exitonforwardfailure" => options.exit_on_forward_failure = parse_yes_no(value)?,
        "gatewayports" => options.gateway_ports = parse_yes_no(value)?,
        "permitlocalcommand" => options.permit_local_command = parse_yes_no(value)?,
        "localcommand" => options.local_command = Some(value.to_string()),
        "proxycommand" => {
            options.proxy_command = if value.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(value.to_string())
            }
        }
        "hostkeyalias" => options.host_key_alias = Some(value.to_string()),
        "tcpkeepalive" => options.tcp_keep_alive = parse_yes_no(value)?,
        "ciphers" => options.ciphers = CipherSpec::List(value.split(',').map(|s| s.to_string()).collect()),
        "macs" => options.macs = Some(value.split(',').map(|s| s.to_string()).collect()),
        other => {
            return Err(Error::configuration(format!("unrecognized configuration option: {:?}", other)));
        }
    }
    Ok(())
}

fn parse_yes_no(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "true" | "on" => Ok(true),
        "no" | "false" | "off" => Ok(false),
        other => Err(Error::configuration(format!("expected yes/no, got {:?}", other))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        let mut argv = vec!["rssh".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        match parse_args(argv).unwrap() {
            ParseOutcome::Run(o) => o,
            ParseOutcome::PrintVersion => panic!("expected Run"),
        }
    }

    #[test]
    fn user_and_host_round_trip() {
        let o = parse(&["alice@example.com"]);
        assert_eq!(o.user.as_deref(), Some("alice"));
        assert_eq!(o.host, "example.com");
    }

    #[test]
    fn bare_host_has_no_user() {
        let o = parse(&["example.com"]);
        assert_eq!(o.user, None);
        assert_eq!(o.host, "example.com");
    }

    #[test]
    fn login_flag_wins_when_destination_is_bare() {
        let o = parse(&["-l", "bob", "example.com"]);
        assert_eq!(o.user.as_deref(), Some("bob"));
    }

    #[test]
    fn command_tokens_join_with_single_spaces() {
        let o = parse(&["example.com", "ls", "-la", "/tmp"]);
        assert_eq!(o.remote_command, vec!["ls", "-la", "/tmp"]);
    }

    #[test]
    fn local_forward_parses() {
        let o = parse(&["-L", "127.0.0.1:8080:internal:80", "example.com"]);
        assert_eq!(o.local_forwards.len(), 1);
        let f = &o.local_forwards[0];
        assert_eq!(f.listen_host.as_deref(), Some("127.0.0.1"));
        assert_eq!(f.listen_port, 8080);
        assert_eq!(f.connect_host, "internal");
        assert_eq!(f.connect_port, 80);
        assert_eq!(f.direction, ForwardDirection::Local);
    }

    #[test]
    fn local_forward_without_listen_host() {
        let o = parse(&["-L", "8080:internal:80", "example.com"]);
        assert_eq!(o.local_forwards[0].listen_host, None);
    }

    #[test]
    fn malformed_forward_is_a_configuration_error() {
        let mut argv = vec!["rssh".to_string(), "-L".to_string(), "nonsense".to_string(), "h".to_string()];
        let err = parse_args(std::mem::take(&mut argv)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn protocol_flags_set_exclusive_masks() {
        let o = parse(&["-1", "example.com"]);
        assert!(o.protocol_mask.v1 && !o.protocol_mask.v2);
        let o = parse(&["-2", "example.com"]);
        assert!(o.protocol_mask.v2 && !o.protocol_mask.v1);
    }

    #[test]
    fn verbosity_caps_at_three() {
        let o = parse(&["-vvvvv", "example.com"]);
        assert_eq!(o.verbosity, 3);
    }

    #[test]
    fn dash_o_folds_strict_host_key_checking() {
        let o = parse(&["-o", "StrictHostKeyChecking=no", "example.com"]);
        assert_eq!(o.strict_host_key_checking, StrictHostKeyChecking::Off);
    }

    #[test]
    fn dash_o_rejects_unknown_key() {
        let mut argv = vec!["rssh".to_string(), "-o".to_string(), "NoSuchOption=1".to_string(), "h".to_string()];
        let err = parse_args(std::mem::take(&mut argv)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn escape_char_accepts_caret_notation_and_none() {
        let o = parse(&["-e", "^X", "example.com"]);
        assert_eq!(o.escape_char, Some((b'X' & 0x1f) as char));
        let o = parse(&["-e", "none", "example.com"]);
        assert_eq!(o.escape_char, None);
    }

    #[test]
    fn version_flag_short_circuits_without_a_host() {
        let argv = vec!["rssh".to_string(), "-V".to_string()];
        match parse_args(argv).unwrap() {
            ParseOutcome::PrintVersion => {}
            ParseOutcome::Run(_) => panic!("expected PrintVersion"),
        }
    }

    #[test]
    fn missing_host_is_a_configuration_error() {
        let argv = vec!["rssh".to_string()];
        let err = parse_args(argv).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
