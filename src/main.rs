//! Entry point. Grounded on cwdbg `server/main.c`.

mod breakpoint;
mod collaborators;
mod commands;
mod config;
mod debugger;
mod error;
mod log;
mod os;
mod protocol;
mod runtime;
mod step;
mod target;
mod transport;
mod wire;

use structopt::StructOpt;

use config::Options;
use log::LogLevel;

fn main() {
    let options = Options::from_args();
    log::set_level(if options.debug { LogLevel::Debug } else { LogLevel::Info });

    let server_mode = debugger::options_to_server_mode(&options);
    let dbg = debugger::create_debugger(server_mode);

    if let Err(e) = debugger::load_target(dbg, &options.target) {
        log!(LogLevel::Error, "could not load target: {}", e);
        debugger::quit_debugger(1);
    }
    log!(LogLevel::Info, "loaded target {}", options.target.display());

    let exit_code = debugger::process_commands(dbg);
    debugger::quit_debugger(exit_code);
}
