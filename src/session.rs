//! Session Orchestrator (C8): the top-level driver described in spec.md
//! §4.8 — dial, banner, key exchange (which calls into the Host-Key
//! Verifier), authenticate, open the primary channel, run the event
//! loop, tear down.
//!
//! `thrussh::client::connect_stream` owns the live banner exchange and
//! the packet/kex state machine end to end (see DESIGN.md's resolution
//! of this tension): the from-scratch `banner` module stays the
//! independently-tested authority on negotiation policy and is the
//! entry point actually used on the `ssh1` feature path, which
//! `thrussh` cannot speak at all. `channel::Multiplexer` is kept as a
//! parallel bookkeeping structure the orchestrator updates alongside
//! the real `thrussh::client::Channel`, giving the rest of this crate
//! (and its tests) the exact data model spec.md §3/§4.7 describe
//! without depending on `thrussh`'s private channel table.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use thrussh::client::{connect_stream, Channel, Config, Handle};
use thrussh::{ChannelMsg, Disconnect};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};

use crate::auth::{authenticate, AuthPlan};
use crate::channel::{Multiplexer, SessionAction};
use crate::dial;
use crate::error::{Error, ExitOutcome, Result};
use crate::handler::Client;
use crate::hostkey_verify::ReadOnly;
use std::sync::Mutex;
use crate::identity::{load_identities, NoSmartcard};
use crate::options::{ForwardSpec, Options};
use crate::privilege;
use crate::sensitive::Sensitive;

const CLIENT_SOFTWARE: &str = "rssh_0.1";

fn build_config(options: &Options) -> Config {
    let (window_size, maximum_packet_size) = if options.want_tty.unwrap_or(false) {
        (crate::channel::DEFAULT_WINDOW / 2, crate::channel::DEFAULT_MAX_PACKET / 2)
    } else {
        (crate::channel::DEFAULT_WINDOW, crate::channel::DEFAULT_MAX_PACKET)
    };
    Config {
        client_id: format!("SSH-2.0-{}", CLIENT_SOFTWARE),
        window_size,
        maximum_packet_size,
        connection_timeout: if options.connection_timeout_ms == 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(options.connection_timeout_ms))
        },
        ..Config::default()
    }
}

/// Best-effort local host name for `%l` identity-path expansion, kept
/// dependency-free (no `hostname` crate anywhere in the corpus): the
/// environment is authoritative when set, matching what a shell-spawned
/// proxy command would also see.
fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Run a connection end to end and return the remote command's exit
/// status, or `ExitOutcome::ClientFailure` mapped from any error the
/// caller surfaces as exit code 255 (spec.md §7).
pub async fn connect_and_run(options: Options) -> Result<ExitOutcome> {
    if options.protocol_mask.v1 && !options.protocol_mask.v2 {
        return run_ssh1(&options);
    }

    // Step 1: drop effective privileges except where explicitly
    // reacquired (reserved-port binds go through PrivilegeBracket).
    privilege::drop_permanently();

    // Step 2: this crate has no host-based/rhosts-RSA call site wired
    // to a real private-key source, so `Sensitive` stays empty; it
    // still participates in the wipe-after-auth ordering.
    let mut sensitive = Sensitive::new();

    // Step 3: dial, then hand the byte pair straight to thrussh, which
    // performs the live banner exchange and key exchange itself.
    let dial_result = dial::dial(&options).await?;
    let resolved_addr = dial_result.resolved_addr.map(|a| a.ip());

    let home_dir = dirs::home_dir()
        .ok_or(Error::NoHomeDir)?
        .to_string_lossy()
        .to_string();
    let local_user = options
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "user".to_string());
    let server_user = options.user.clone().unwrap_or_else(|| local_user.clone());
    let local_host = local_host_name();

    let identities = load_identities(&options, &home_dir, &local_user, &server_user, &local_host, &NoSmartcard)?;

    let user_known_hosts = if options.known_hosts_user.as_os_str().is_empty() {
        std::path::PathBuf::from(home_dir.clone()).join(".ssh/known_hosts")
    } else {
        options.known_hosts_user.clone()
    };

    let config = Arc::new(build_config(&options));
    let verify_result: crate::handler::VerifyResultSlot = Arc::new(Mutex::new(None));
    let client = Client {
        options: options.clone(),
        resolved_addr,
        user_known_hosts,
        system_known_hosts: options.known_hosts_system.clone(),
        read_only: if options.batch_mode { ReadOnly::RoQuiet } else { ReadOnly::Rw },
        verify_result: verify_result.clone(),
    };

    // Steps 3-4: `connect_stream` performs the banner exchange and key
    // exchange, calling `Client::check_server_key` (our Host-Key
    // Verifier seam, C5) with the first server host key it receives.
    let mut handle = connect_stream(config, dial_result.stream, client)
        .await
        .map_err(|e| e.0)?;

    // Step 5: wipe sensitive material now that key exchange is past.
    sensitive.wipe();

    // spec.md §4.5 CHANGED verdict: `check_server_key` (handler.rs)
    // stashed its `VerifyOutcome` in `verify_result` since the `Client`
    // it ran on was moved into `connect_stream` and is gone by now. Pull
    // out the adjusted `Options` (if a downgrade fired) and use it for
    // everything from here on — the auth plan and every forwarding loop
    // below — instead of the pre-verification `options`, or a CHANGED
    // host under `strict=off` would still run password/keyboard-
    // interactive auth and open every configured forward (concrete
    // scenario 2).
    let verify_outcome = verify_result.lock().unwrap().take();
    let downgrade = verify_outcome.as_ref().and_then(|o| o.downgrade.clone());
    let options = verify_outcome
        .and_then(|o| o.adjusted_options)
        .unwrap_or(options);

    // Step 6: authenticate.
    let plan = AuthPlan {
        local_user: &local_user,
        server_user: &server_user,
        host: &options.host,
        password: std::env::var("RSSH_PASSWORD").ok(),
        allow_password: !options.batch_mode && downgrade.is_none(),
        allow_keyboard_interactive: !options.batch_mode && downgrade.is_none(),
    };
    authenticate(&mut handle, &plan, &identities, &sensitive).await?;

    let mut mux = Multiplexer::new();
    for forward in &options.local_forwards {
        mux.setup_local_forward(
            forward.listen_host.clone(),
            forward.listen_port,
            forward.connect_host.clone(),
            forward.connect_port,
        );
    }

    // Step 7: open the primary channel (or, under `-N`, a bare channel
    // solely to carry the global tcpip-forward requests) unless there
    // is truly nothing to do.
    let want_tty = options.want_tty.unwrap_or(options.remote_command.is_empty());
    let no_session_channel = options.no_remote_command && options.remote_command.is_empty();

    let session_id = mux.open_session(!no_session_channel && want_tty);
    let mut channel = handle.channel_open_session().await?;
    if let Some(c) = mux.channel_mut(session_id) {
        c.confirm_open(channel.writable_packet_size() as u32, crate::channel::DEFAULT_MAX_PACKET);
    }

    // Fork-after-authentication (`-f`), immediate case: daemonize now
    // when there's nothing worth deferring for (spec.md §4.8's
    // "Fork-after-authentication" semantics).
    let immediate_background = fork_after_auth_is_immediate(&options);
    if immediate_background {
        daemonize("immediately after session setup; no remote-forward confirm to wait for");
    }

    // Registers the forward and its confirm callback (spec.md §4.7).
    // The pinned `thrussh` client never parses a `REQUEST_SUCCESS`/
    // `REQUEST_FAILURE` reply or an inbound `CHANNEL_OPEN`, so neither
    // the confirm callback nor bridging an accepted connection can run
    // live here: see DESIGN.md's "Remote-forward data path" entry. That
    // also means the deferred fork-after-auth case below cannot truly
    // wait for a confirm reply; awaiting every `tcpip_forward` send is
    // the closest available stand-in for "all confirms received".
    for forward in &options.remote_forwards {
        let idx = mux.request_remote_forward(
            forward.listen_host.clone(),
            forward.listen_port,
            forward.connect_host.clone(),
            forward.connect_port,
        );
        let address = forward.listen_host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        if let Err(e) = channel
            .tcpip_forward(true, address, forward.listen_port as u32)
            .await
        {
            if options.exit_on_forward_failure {
                return Err(Error::ForwardingFailed(format!("remote forward #{}: {}", idx, e)));
            }
            warn!("remote forward #{} request failed: {}", idx, e);
        }
    }

    // Fork-after-authentication, deferred case: everything that would
    // have made the immediate case fire already didn't, so this is the
    // branch that waited.
    if options.fork_after_authentication && !immediate_background {
        daemonize("after all remote-forward requests were sent");
    }

    // `setup_local_forward`'s listener bind and per-accept `direct-tcp`
    // channel open (spec.md §4.7) run as a side task per forward,
    // funneling accepted sockets back through a single channel so the
    // one live `Handle` is only ever touched from this task.
    let (_listener_tasks, mut accept_rx) = spawn_local_forward_listeners(&options.local_forwards).await?;
    let forward_activity = Arc::new(ForwardActivity::default());

    // Runs synchronously and is awaited to completion before the event
    // loop starts, mirroring `ssh_local_cmd`'s fork/exec/waitpid (spec.md
    // §2 supplement; `sshconnect.c`'s `ssh_local_cmd`).
    run_local_command(&options, &local_user, &server_user, &local_host).await;

    if no_session_channel {
        info!("no-remote-command requested (-N); skipping shell/exec, running forwardings only");
        run_forwards_only_event_loop(&mut handle, &options.local_forwards, &mut accept_rx, &forward_activity).await;
        teardown(&mut handle, &dial_result.proxy_pid, &options).await;
        return Ok(ExitOutcome::Code(0));
    }

    let action = if let Some(subsystem) = &options.subsystem {
        SessionAction::Subsystem(subsystem.clone())
    } else if options.remote_command.is_empty() {
        SessionAction::Shell
    } else {
        SessionAction::Exec(options.remote_command.join(" "))
    };
    mux.setup_session(session_id, want_tty, options.forward_x11, options.forward_agent, &[], action.clone());

    if want_tty {
        channel.request_pty(false, "xterm", 80, 24, 0, 0, &[]).await?;
    }
    if options.forward_x11 {
        channel
            .request_x11(false, false, "MIT-MAGIC-COOKIE-1", "", 0)
            .await?;
    }
    match action {
        SessionAction::Exec(cmd) => channel.exec(true, cmd).await?,
        SessionAction::Subsystem(name) => channel.request_subsystem(true, name).await?,
        SessionAction::Shell => channel.request_shell(true).await?,
    }

    // Step 9: run the channel event loop until no open channels remain and
    // no forwardings are active.
    let outcome = run_primary_event_loop(
        &mut channel,
        &mut handle,
        &options.local_forwards,
        &mut accept_rx,
        &forward_activity,
    )
    .await?;

    // Step 10: teardown.
    teardown(&mut handle, &dial_result.proxy_pid, &options).await;

    Ok(outcome)
}

/// Expand `%d`/`%h`/`%l`/`%n`/`%p`/`%r`/`%u`/`%%` in a `LocalCommand`
/// string, mirroring `ssh.c`'s `percent_expand` call ahead of
/// `ssh_local_cmd` (spec.md §2 supplement). Unlike `identity::expand_path`
/// this never tilde-expands (a shell command, not a file path) and adds
/// `%n`/`%p`, which identity paths don't need. This crate does not model
/// a separate `HostKeyAlias`, so `%h` and `%n` both resolve to the
/// configured host.
fn expand_local_command(
    raw: &str,
    home_dir: &str,
    local_user: &str,
    remote_user: &str,
    remote_host: &str,
    local_host: &str,
    port: u16,
) -> String {
    let port = port.to_string();
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('d') => out.push_str(home_dir),
            Some('h') | Some('n') => out.push_str(remote_host),
            Some('l') => out.push_str(local_host),
            Some('p') => out.push_str(&port),
            Some('r') => out.push_str(remote_user),
            Some('u') => out.push_str(local_user),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Run `Options::local_command` through `$SHELL -c`, waiting for it to
/// exit before the caller continues, exactly as `ssh_local_cmd` forks,
/// execs, and `waitpid`s synchronously. A non-zero exit or spawn failure
/// is logged but never aborts the connection (`ssh_local_cmd` itself
/// only ever returns a status ssh.c's callers discard).
async fn run_local_command(options: &Options, local_user: &str, server_user: &str, local_host: &str) {
    if !options.permit_local_command {
        return;
    }
    let Some(raw) = &options.local_command else {
        return;
    };
    let home_dir = dirs::home_dir()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    let command = expand_local_command(raw, &home_dir, local_user, server_user, &options.host, local_host, options.port);
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    debug!("executing LocalCommand: {} -c {:?}", shell, command);
    match tokio::process::Command::new(&shell).arg("-c").arg(&command).status().await {
        Ok(status) if !status.success() => {
            warn!("LocalCommand exited with status {}", status);
        }
        Ok(_) => {}
        Err(e) => warn!("couldn't execute LocalCommand {:?}: {}", command, e),
    }
}

/// One accepted local-forward connection, labeled by its `local_forwards`
/// index so the owner of `handle` knows which `connect_host`/`connect_port`
/// to open the `direct-tcpip` channel against (spec.md §4.7
/// `setup_local_forward`).
struct ForwardAccept {
    forward_index: usize,
    stream: tokio::net::TcpStream,
}

/// Bind one listener per configured local forward and fan accepted
/// connections into a single channel, so the single live `Handle<Client>`
/// is only ever driven from the orchestrator's own task (thrussh's
/// `Handle` takes `&mut self` on every call and is not `Clone`).
async fn spawn_local_forward_listeners(
    forwards: &[ForwardSpec],
) -> Result<(Vec<tokio::task::JoinHandle<()>>, mpsc::Receiver<ForwardAccept>)> {
    let (tx, rx) = mpsc::channel(16);
    let mut tasks = Vec::with_capacity(forwards.len());
    for (forward_index, forward) in forwards.iter().enumerate() {
        let bind_host = forward.listen_host.clone().unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_addr = format!("{}:{}", bind_host, forward.listen_port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            Error::ForwardingFailed(format!("binding local forward listener {}: {}", bind_addr, e))
        })?;
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        if tx.send(ForwardAccept { forward_index, stream }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("local forward listener {} accept failed: {}", bind_addr, e);
                        break;
                    }
                }
            }
        }));
    }
    Ok((tasks, rx))
}

/// Tracks how many `direct-tcpip` bridge tasks are currently pumping
/// bytes, so the event loop can honor spec.md §4.8 step 9 ("no open
/// channels remain and no forwardings are active") instead of exiting
/// out from under an in-flight forwarded connection the moment the
/// primary channel closes. `leave` uses `notify_one` rather than
/// `notify_waiters` so a decrement racing just ahead of the loop's
/// `is_idle` check still wakes it (the permit is stored, not dropped).
#[derive(Default)]
struct ForwardActivity {
    count: AtomicUsize,
    idle: Notify,
}

impl ForwardActivity {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_one();
        }
    }

    fn is_idle(&self) -> bool {
        self.count.load(Ordering::SeqCst) == 0
    }
}

/// Open a `direct-tcpip` channel for one accepted local-forward socket and
/// spawn a task that bridges the two halves until either side closes.
async fn handle_forward_accept(
    handle: &mut Handle<Client>,
    forwards: &[ForwardSpec],
    accept: ForwardAccept,
    activity: &Arc<ForwardActivity>,
) {
    let forward = match forwards.get(accept.forward_index) {
        Some(f) => f,
        None => return,
    };
    let (peer, peer_port) = match accept.stream.peer_addr() {
        Ok(addr) => (addr.ip().to_string(), addr.port() as u32),
        Err(_) => ("0.0.0.0".to_string(), 0),
    };
    match handle
        .channel_open_direct_tcpip(forward.connect_host.clone(), forward.connect_port as u32, peer, peer_port)
        .await
    {
        Ok(channel) => {
            activity.enter();
            let activity = Arc::clone(activity);
            tokio::spawn(async move {
                bridge_direct_tcp(channel, accept.stream).await;
                activity.leave();
            });
        }
        Err(e) => {
            warn!(
                "local forward #{} ({} -> {}:{}): channel open failed: {}",
                accept.forward_index, forward.listen_port, forward.connect_host, forward.connect_port, e
            );
        }
    }
}

/// Pump bytes between a locally-accepted TCP socket and its
/// `direct-tcpip` channel until either side signals EOF/close.
async fn bridge_direct_tcp(mut channel: Channel, mut stream: tokio::net::TcpStream) {
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            n = stream.read(&mut buf) => {
                match n {
                    Ok(0) => {
                        let _ = channel.eof().await;
                        break;
                    }
                    Ok(n) => {
                        if channel.data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if stream.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }
    }
}

/// Pump stdin to the channel and the channel's data/extended-data/exit
/// events to stdout/stderr, returning the remote command's exit status.
/// This is the steady-state loop spec.md §4.8 step 9 and §5 describe as
/// the single readiness-wait suspension point.
async fn run_primary_event_loop(
    channel: &mut Channel,
    handle: &mut Handle<Client>,
    local_forwards: &[ForwardSpec],
    accept_rx: &mut mpsc::Receiver<ForwardAccept>,
    activity: &Arc<ForwardActivity>,
) -> Result<ExitOutcome> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut stdin_buf = [0u8; 8192];
    let mut stdin_open = true;
    let mut primary_done: Option<ExitOutcome> = None;

    loop {
        // The primary channel has already produced its outcome; all that's
        // left is draining forwarded connections per spec.md §4.8 step 9
        // ("no open channels remain and no forwardings are active").
        if let Some(outcome) = primary_done {
            if activity.is_idle() {
                return Ok(outcome);
            }
            tokio::select! {
                accept = accept_rx.recv() => {
                    if let Some(accept) = accept {
                        handle_forward_accept(handle, local_forwards, accept, activity).await;
                    }
                }
                _ = activity.idle.notified() => {}
            }
            primary_done = Some(outcome);
            continue;
        }

        tokio::select! {
            n = stdin.read(&mut stdin_buf), if stdin_open => {
                match n {
                    Ok(0) => {
                        stdin_open = false;
                        let _ = channel.eof().await;
                    }
                    Ok(n) => {
                        let _ = channel.data(&stdin_buf[..n]).await;
                    }
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        stdin_open = false;
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let _ = stdout.write_all(&data).await;
                        let _ = stdout.flush().await;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: _ }) => {
                        let _ = stderr.write_all(&data).await;
                        let _ = stderr.flush().await;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        primary_done = Some(ExitOutcome::Code(exit_status as i32));
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        warn!("remote process terminated by signal: {:?}", signal_name);
                        primary_done = Some(ExitOutcome::ClientFailure);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                        primary_done = Some(ExitOutcome::Code(0));
                    }
                    Some(_) => {}
                    None => primary_done = Some(ExitOutcome::Code(0)),
                }
            }
            accept = accept_rx.recv() => {
                match accept {
                    Some(accept) => handle_forward_accept(handle, local_forwards, accept, activity).await,
                    None => {}
                }
            }
        }
    }
}

/// `-N` mode: no primary session channel, so the event loop is solely the
/// local-forward accept/bridge machinery, run until the process is
/// interrupted (spec.md §4.8 step 7's "unless -N"; no primary channel
/// means there is no remote exit status to wait on). `activity` is
/// threaded through for parity with the primary loop even though nothing
/// here waits on it going idle — there is no primary channel outcome to
/// hold open for.
async fn run_forwards_only_event_loop(
    handle: &mut Handle<Client>,
    local_forwards: &[ForwardSpec],
    accept_rx: &mut mpsc::Receiver<ForwardAccept>,
    activity: &Arc<ForwardActivity>,
) {
    if local_forwards.is_empty() {
        debug!("no forwardings registered under -N; nothing to run");
        return;
    }
    while let Some(accept) = accept_rx.recv().await {
        handle_forward_accept(handle, local_forwards, accept, activity).await;
    }
}

/// `-f`'s deferral rule (spec.md §4.8): background immediately unless
/// `exit_on_forward_failure` is set and there is at least one remote
/// forward to wait on, in which case backgrounding defers until those
/// requests' confirms are in (see the deferred call site above for why
/// this build can only approximate "confirms are in").
fn fork_after_auth_is_immediate(options: &Options) -> bool {
    options.fork_after_authentication && (!options.exit_on_forward_failure || options.remote_forwards.is_empty())
}

/// Background the process per `-f`'s "fork-after-authentication"
/// semantics (spec.md §4.8). No real `fork`/`setsid` backs this: by this
/// point the `tokio` multi-threaded runtime has already spawned OS
/// threads, and forking a multithreaded process leaves every mutex held
/// by a non-forking thread locked forever in the child — undefined
/// behavior, not a corner case to paper over. No corpus source grounds a
/// runtime-safe daemonize primitive, so this models only the *decision*
/// of when backgrounding would occur (immediate vs. deferred until
/// remote-forward requests are sent), the same treatment `privilege.rs`
/// gives the missing `setuid` primitive.
fn daemonize(trigger: &str) {
    info!("fork-after-authentication requested; backgrounding ({}) is a no-op in this build (see DESIGN.md)", trigger);
}

async fn teardown(handle: &mut Handle<Client>, proxy_pid: &Option<u32>, options: &Options) {
    let _ = handle.disconnect(Disconnect::ByApplication, "", "").await;
    if let Some(path) = &options.control_path {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
    if let Some(pid) = proxy_pid {
        #[cfg(unix)]
        unsafe {
            send_sighup(*pid as i32);
        }
        #[cfg(not(unix))]
        let _ = pid;
    }
}

/// Send SIGHUP to the proxy-command child on shutdown, per spec.md
/// §4.8 step 10 / §5 ("signals it with SIGHUP on shutdown"). A single
/// raw `extern "C"` call rather than a full `libc` dependency, since
/// `kill` is the only syscall needed here.
#[cfg(unix)]
unsafe fn send_sighup(pid: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    let _ = kill(pid, 1);
}

/// The feature-gated legacy path. Never reached unless both the `ssh1`
/// feature is compiled in and the negotiated protocol mask selects v1;
/// `thrussh` has no SSH-1 implementation, so this stub exists only to
/// produce a clear diagnostic instead of silently trying (and failing)
/// to speak SSH-2 framing to a v1-only peer.
fn run_ssh1(_options: &Options) -> Result<ExitOutcome> {
    warn!("SSH protocol 1 was negotiated; this build has no SSH-1 packet layer");
    Err(Error::Protocol1Unsupported)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn local_host_name_falls_back_to_localhost() {
        std::env::remove_var("HOSTNAME");
        std::env::remove_var("HOST");
        assert_eq!(local_host_name(), "localhost");
    }

    #[test]
    fn expand_local_command_substitutes_all_tokens() {
        let expanded = expand_local_command(
            "echo %u@%h:%p from %l (%r, home=%d, n=%n) %%",
            "/home/alice",
            "alice",
            "bob",
            "example.com",
            "workstation",
            2222,
        );
        assert_eq!(
            expanded,
            "echo alice@example.com:2222 from workstation (bob, home=/home/alice, n=example.com) %"
        );
    }

    /// `-f -R 0:localhost:22 -o ExitOnForwardFailure=yes` (spec.md §10
    /// test 6): backgrounding must defer, not fire immediately.
    #[test]
    fn fork_after_auth_defers_when_forward_must_confirm() {
        let mut options = Options::default();
        options.fork_after_authentication = true;
        options.exit_on_forward_failure = true;
        options.remote_forwards.push(crate::options::ForwardSpec {
            listen_host: None,
            listen_port: 0,
            connect_host: "localhost".to_string(),
            connect_port: 22,
            direction: crate::options::ForwardDirection::Remote,
        });
        assert!(!fork_after_auth_is_immediate(&options));
    }

    #[test]
    fn fork_after_auth_is_immediate_without_forwards_to_wait_on() {
        let mut options = Options::default();
        options.fork_after_authentication = true;
        options.exit_on_forward_failure = true;
        assert!(fork_after_auth_is_immediate(&options));
    }

    #[test]
    fn fork_after_auth_is_immediate_when_failures_are_tolerated() {
        let mut options = Options::default();
        options.fork_after_authentication = true;
        options.exit_on_forward_failure = false;
        options.remote_forwards.push(crate::options::ForwardSpec {
            listen_host: None,
            listen_port: 0,
            connect_host: "localhost".to_string(),
            connect_port: 22,
            direction: crate::options::ForwardDirection::Remote,
        });
        assert!(fork_after_auth_is_immediate(&options));
    }

    /// An accepted local-forward connection is labeled with the right
    /// `local_forwards` index so `handle_forward_accept` opens the
    /// `direct-tcpip` channel against the matching `connect_host`/`port`.
    #[tokio::test]
    async fn local_forward_accept_is_labeled_with_its_forward_index() {
        // Reserve a free loopback port, then release it before re-binding
        // through `spawn_local_forward_listeners` (the usual free-port
        // test idiom; the brief window is not a real flake risk for a
        // loopback-only bind).
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let forwards = vec![ForwardSpec {
            listen_host: Some("127.0.0.1".to_string()),
            listen_port: port,
            connect_host: "internal".to_string(),
            connect_port: 80,
            direction: crate::options::ForwardDirection::Local,
        }];

        let (_tasks, mut rx) = spawn_local_forward_listeners(&forwards).await.unwrap();

        let _client = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let accept = rx.recv().await.expect("accept should be forwarded");
        assert_eq!(accept.forward_index, 0);
    }

    /// spec.md §4.8 step 9 ("no open channels remain and no forwardings
    /// are active"): the primary loop must not treat the primary channel's
    /// own close as sufficient to exit while a bridge task is still live.
    #[test]
    fn forward_activity_tracks_concurrent_bridges() {
        let activity = ForwardActivity::default();
        assert!(activity.is_idle());
        activity.enter();
        activity.enter();
        assert!(!activity.is_idle());
        activity.leave();
        assert!(!activity.is_idle());
        activity.leave();
        assert!(activity.is_idle());
    }
}
