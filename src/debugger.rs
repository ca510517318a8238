//! The `Debugger` singleton. Grounded on cwdbg `server/debugger.h`
//! (`Debugger`, the global `gp_dbg` pointer, `create_debugger` /
//! `quit_debugger`). SPEC_FULL.md §9 resolves the raw global pointer
//! into an initialize-once-immutable global of type `OnceLock`.

use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex, OnceLock};

use crate::collaborators::{Disassembler, FakeDisassembler, FakeLoader, Loader};
use crate::commands::cli::LocalCli;
use crate::commands::remote::RemoteSession;
use crate::config::Options;
use crate::error::DbgResult;
use crate::log::{self, LogLevel};
use crate::os::{OsTasking, ThreadOsTasking};
use crate::runtime::{SimulatedTargetRuntime, TargetRuntime};
use crate::target::Target;

pub struct Debugger {
    pub target: Mutex<Target>,
    pub server_mode: bool,
}

static DEBUGGER: OnceLock<Debugger> = OnceLock::new();

/// Creates the one Debugger instance for this process. Panics if called
/// twice, matching the "exactly one live instance per process"
/// invariant in SPEC_FULL.md §3 — this is a startup-only constructor,
/// not a runtime operation.
pub fn create_debugger(server_mode: bool) -> &'static Debugger {
    let loader: Box<dyn Loader> = Box::new(FakeLoader::default());
    let disassembler: Box<dyn Disassembler> = Box::new(FakeDisassembler);
    let os: Arc<dyn OsTasking> = Arc::new(ThreadOsTasking);
    let runtime: Arc<dyn TargetRuntime> = Arc::new(SimulatedTargetRuntime);
    let target = Target::new(loader, disassembler, os, runtime);

    DEBUGGER
        .set(Debugger {
            target: Mutex::new(target),
            server_mode,
        })
        .unwrap_or_else(|_| panic!("create_debugger called more than once"));
    DEBUGGER.get().expect("just initialized")
}

pub fn get_debugger() -> Option<&'static Debugger> {
    DEBUGGER.get()
}

pub fn load_target(dbg: &Debugger, path: &Path) -> DbgResult<()> {
    dbg.target.lock().unwrap().load(path)
}

/// Drives the whole session to completion, local or remote per
/// `dbg.server_mode`, and returns the process exit code.
pub fn process_commands(dbg: &'static Debugger) -> i32 {
    let mut target = dbg.target.lock().unwrap();
    if dbg.server_mode {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        let mut session = RemoteSession::new(StdioStream { stdin, stdout });
        match session.run_session(&mut target) {
            Ok(code) => code,
            Err(e) => {
                log!(LogLevel::Crit, "remote session ended: {}", e);
                1
            }
        }
    } else {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        let mut cli = LocalCli::new(stdin.lock(), stdout.lock());
        cli.run_session(&mut target)
    }
}

pub fn quit_debugger(exit_code: i32) -> ! {
    log!(LogLevel::Info, "quitting with exit code {}", exit_code);
    process::exit(exit_code);
}

/// Wraps stdin/stdout as one full-duplex stream for the remote session,
/// since the serial link is modeled as a single `Read + Write` type.
struct StdioStream {
    stdin: std::io::Stdin,
    stdout: std::io::Stdout,
}

impl std::io::Read for StdioStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::io::Read;
        self.stdin.lock().read(buf)
    }
}

impl std::io::Write for StdioStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        use std::io::Write;
        self.stdout.lock().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        use std::io::Write;
        self.stdout.lock().flush()
    }
}

pub fn options_to_server_mode(options: &Options) -> bool {
    options.server
}
