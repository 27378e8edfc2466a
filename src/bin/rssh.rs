//! The binary entry point: parse argv, initialize logging, run the
//! orchestrator, and map the outcome onto a process exit code.
//!
//! Exit code 255 signals any client-side failure (spec.md §6); otherwise
//! the exit code is the remote command's reported exit status. Grounded
//! on `examples/original_source/ssh.c`'s `main` for this top-level shape
//! and on `thrussh/examples/client.rs` for the `#[tokio::main]` async
//! entry point already idiomatic to this crate's dependency stack.

use rssh::cli::{self, ParseOutcome};
use rssh::error::{ExitOutcome, EXIT_FAILURE};
use rssh::{logging, session};

#[tokio::main]
async fn main() {
    // SIGPIPE is ignored process-wide, per spec.md §5; writes past a
    // closed pipe surface as ordinary I/O errors instead of terminating
    // the process.
    #[cfg(unix)]
    ignore_sigpipe();

    let options = match cli::parse_args(std::env::args()) {
        Ok(ParseOutcome::Run(options)) => options,
        Ok(ParseOutcome::PrintVersion) => {
            println!("rssh_{}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("rssh: {}", e);
            std::process::exit(EXIT_FAILURE);
        }
    };

    logging::init(&options);

    match session::connect_and_run(options).await {
        Ok(ExitOutcome::Code(code)) => std::process::exit(code),
        Ok(ExitOutcome::ClientFailure) => std::process::exit(EXIT_FAILURE),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(EXIT_FAILURE);
        }
    }
}

/// A single raw `signal` call rather than a full `libc`/`signal-hook`
/// dependency, matching `session.rs`'s existing narrow `extern "C"` use
/// for `kill`.
#[cfg(unix)]
fn ignore_sigpipe() {
    extern "C" {
        fn signal(signum: i32, handler: usize) -> usize;
    }
    const SIGPIPE: i32 = 13;
    const SIG_IGN: usize = 1;
    unsafe {
        signal(SIGPIPE, SIG_IGN);
    }
}
