//! Local interactive console. Grounded on cwdbg `server/cli.c`
//! (`process_cli_commands`, single-character dispatch).

use std::io::{self, BufRead, Write};

use crate::commands::CommandSource;
use crate::log;
use crate::log::LogLevel;
use crate::target::{ServiceOutcome, Target, TargetState};

pub struct LocalCli<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LocalCli<R, W> {
    pub fn new(input: R, output: W) -> LocalCli<R, W> {
        LocalCli { input, output }
    }

    fn prompt(&mut self) {
        let _ = write!(self.output, "> ");
        let _ = self.output.flush();
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim_end().to_string())
    }

    /// Top-level entry point: the "not running" half of the loop
    /// (set/clear breakpoints, `r` to run, `q` to quit). Returns the
    /// process exit code once `q` is issued.
    pub fn run_session(&mut self, target: &mut Target) -> i32 {
        loop {
            self.prompt();
            let line = match self.read_line() {
                Ok(l) if !l.is_empty() => l,
                Ok(_) => continue,
                Err(_) => return 0,
            };
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("r") => {
                    if let Err(e) = target.run(self) {
                        log!(LogLevel::Error, "run failed: {}", e);
                    }
                }
                Some("b") => self.cmd_set_breakpoint(target, parts.next()),
                Some("d") => self.cmd_clear_breakpoint(target, parts.next()),
                Some("p") => self.cmd_peek(target, parts.next(), parts.next()),
                Some("q") => return 0,
                _ => {
                    let _ = writeln!(self.output, "unknown or unavailable command");
                }
            }
        }
    }

    fn cmd_set_breakpoint(&mut self, target: &mut Target, offset: Option<&str>) {
        let offset = offset.and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok());
        match offset {
            Some(off) => match target.set_breakpoint(off, false) {
                Ok(id) => {
                    let _ = writeln!(self.output, "breakpoint {} set at offset {:#x}", id, off);
                }
                Err(e) => {
                    let _ = writeln!(self.output, "could not set breakpoint: {}", e);
                }
            },
            None => {
                let _ = writeln!(self.output, "usage: b <hex-offset>");
            }
        }
    }

    fn cmd_clear_breakpoint(&mut self, target: &mut Target, id: Option<&str>) {
        let id = id.and_then(|s| s.parse::<u32>().ok());
        match id {
            Some(id) => match target.clear_breakpoint(id) {
                Ok(()) => {
                    let _ = writeln!(self.output, "breakpoint {} cleared", id);
                }
                Err(e) => {
                    let _ = writeln!(self.output, "could not clear breakpoint: {}", e);
                }
            },
            None => {
                let _ = writeln!(self.output, "usage: d <id>");
            }
        }
    }

    fn cmd_peek(&mut self, target: &Target, addr: Option<&str>, size: Option<&str>) {
        let addr = addr.and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok());
        let size = size.and_then(|s| s.parse::<usize>().ok());
        match (addr, size) {
            (Some(addr), Some(size)) => match target.peek_memory(addr, size) {
                Ok(bytes) => {
                    let _ = writeln!(self.output, "{:02x?}", bytes);
                }
                Err(e) => {
                    let _ = writeln!(self.output, "could not read memory: {}", e);
                }
            },
            _ => {
                let _ = writeln!(self.output, "usage: p <hex-addr> <size>");
            }
        }
    }

    fn print_stop_report(&mut self, target: &Target) {
        let info = target.get_target_info();
        let _ = writeln!(
            self.output,
            "stopped: state={:#x} pc={:#x} exit_code={}",
            info.state, info.task_context.pc, info.exit_code
        );
        if let Some((text, _)) = target.disassemble_next() {
            let _ = writeln!(self.output, "next: {}", text);
        }
    }
}

impl<R: BufRead, W: Write> CommandSource for LocalCli<R, W> {
    fn service(&mut self, target: &mut Target) -> ServiceOutcome {
        self.print_stop_report(target);
        if target.state.contains(TargetState::EXITED) || target.state.contains(TargetState::ERROR) {
            let _ = writeln!(self.output, "target finished");
            return ServiceOutcome::Quit(target.exit_code);
        }
        loop {
            self.prompt();
            let line = match self.read_line() {
                Ok(l) => l,
                Err(_) => return ServiceOutcome::Killed,
            };
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("c") => {
                    target.continue_target();
                    return ServiceOutcome::Resumed;
                }
                Some("s") | None => {
                    target.step_target();
                    return ServiceOutcome::Resumed;
                }
                Some("k") => {
                    target.kill();
                    return ServiceOutcome::Killed;
                }
                Some("q") => return ServiceOutcome::Quit(0),
                Some("b") => self.cmd_set_breakpoint(target, parts.next()),
                Some("d") => self.cmd_clear_breakpoint(target, parts.next()),
                Some("p") => self.cmd_peek(target, parts.next(), parts.next()),
                Some("i") => self.print_stop_report(target),
                _ => {
                    let _ = writeln!(self.output, "unknown or unavailable command");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FakeDisassembler, InMemoryLoader};
    use crate::runtime::SimulatedTargetRuntime;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::Arc;

    fn new_target(code: Vec<u8>) -> Target {
        let loader = InMemoryLoader {
            entry_pc: 0x1000,
            initial_sp: 0x8000,
            code,
        };
        Target::new(
            Box::new(loader),
            Box::new(FakeDisassembler),
            Arc::new(crate::os::ThreadOsTasking),
            Arc::new(SimulatedTargetRuntime),
        )
    }

    #[test]
    fn continue_through_breakpoint_to_exit_via_cli_scripted_input() {
        let code = vec![0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x40, 0x4E, 0x75];
        let mut target = new_target(code);
        target.load(Path::new("unused")).unwrap();
        target.set_breakpoint(6, false).unwrap();

        // First stop prints a report and reads "c"; second stop (exit)
        // is terminal and needs no further input.
        let input = Cursor::new(b"c\n".to_vec());
        let mut output = Vec::new();
        let mut cli = LocalCli::new(input, &mut output);
        target.run(&mut cli).unwrap();

        assert!(target.state.contains(TargetState::EXITED));
    }
}
