//! The target supervisor (C5) and the saved-register data model (§3).
//! Grounded on cwdbg `server/target.c` / `target.h`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use serde::Serialize;

use crate::breakpoint::{BreakpointTable, TRAP_OPCODE};
use crate::collaborators::{Disassembler, LoadedImage, Loader};
use crate::error::{DbgError, DbgResult};
use crate::log;
use crate::log::LogLevel;
use crate::os::{OsTasking, Signal, TaskHandle};
use crate::runtime::{ExceptionBridge, SignalBridge, StopReason, TargetRuntime};
use crate::step;
use crate::wire;

pub const TARGET_STACK_SIZE: usize = 8192;

/// Saved register frame captured by the trap handler at a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub sp: u32,
    pub exc_num: u32,
    pub sr: u16,
    pub pc: u32,
    pub d: [u32; 8],
    pub a: [u32; 7],
}

impl TaskContext {
    pub fn new(sp: u32, pc: u32) -> TaskContext {
        TaskContext {
            sp,
            exc_num: 0,
            sr: 0,
            pc,
            d: [0; 8],
            a: [0; 7],
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TargetState: u32 {
        const RUNNING                  = 1 << 0;
        const SINGLE_STEPPING          = 1 << 1;
        const EXITED                   = 1 << 2;
        const KILLED                   = 1 << 3;
        const STOPPED_BY_BP            = 1 << 4;
        const STOPPED_BY_ONESHOT_BP    = 1 << 5;
        const STOPPED_BY_SINGLE_STEP   = 1 << 6;
        const STOPPED_BY_EXCEPTION     = 1 << 7;
        const ERROR                    = 1 << 8;
    }
}

impl TargetState {
    const STOP_MASK: TargetState = TargetState::from_bits_truncate(
        TargetState::STOPPED_BY_BP.bits()
            | TargetState::STOPPED_BY_ONESHOT_BP.bits()
            | TargetState::STOPPED_BY_SINGLE_STEP.bits()
            | TargetState::STOPPED_BY_EXCEPTION.bits(),
    );

    pub fn clear_stop_reason(&mut self) {
        self.remove(Self::STOP_MASK);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub initial_pc: u32,
    pub initial_sp: u32,
    pub state: u32,
    pub exit_code: i32,
    pub error_code: u32,
    pub task_context: TaskContext,
    pub next_instr_bytes: Vec<u8>,
    pub top_stack_dwords: Vec<u32>,
    pub bpoint: Option<BpointInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BpointInfo {
    pub id: u32,
    pub addr: u32,
    pub opcode: u16,
    pub hit_count: u32,
}

/// What the active command loop asked the supervisor to do once it is
/// done servicing the current stop.
pub enum ServiceOutcome {
    /// Resume with the context as currently staged on `Target`
    /// (mutated by `continue_target`/`step_target`).
    Resumed,
    Killed,
    Quit(i32),
}

pub struct Target {
    loader: Box<dyn Loader>,
    disassembler: Box<dyn Disassembler>,
    os: Arc<dyn OsTasking>,
    runtime: Arc<dyn TargetRuntime>,

    image: Option<Arc<Mutex<LoadedImage>>>,
    entry_pc: u32,
    initial_sp: u32,

    pub state: TargetState,
    pub exit_code: i32,
    pub error_code: Option<DbgError>,

    pub breakpoints: BreakpointTable,
    pub active_breakpoint: Option<u32>,
    pub active_context: Option<TaskContext>,

    task_handle: Option<TaskHandle>,
    bridge: Option<Arc<SignalBridge>>,
    resume_signal: Option<Signal>,
}

impl Target {
    pub fn new(
        loader: Box<dyn Loader>,
        disassembler: Box<dyn Disassembler>,
        os: Arc<dyn OsTasking>,
        runtime: Arc<dyn TargetRuntime>,
    ) -> Target {
        Target {
            loader,
            disassembler,
            os,
            runtime,
            image: None,
            entry_pc: 0,
            initial_sp: 0,
            state: TargetState::empty(),
            exit_code: 0,
            error_code: None,
            breakpoints: BreakpointTable::new(),
            active_breakpoint: None,
            active_context: None,
            task_handle: None,
            bridge: None,
            resume_signal: None,
        }
    }

    pub fn load(&mut self, path: &Path) -> DbgResult<()> {
        let image = self.loader.load(path)?;
        self.entry_pc = image.entry_pc;
        self.initial_sp = image.initial_sp;
        self.image = Some(Arc::new(Mutex::new(image)));
        Ok(())
    }

    pub fn entry_pc(&self) -> u32 {
        self.entry_pc
    }

    pub fn is_running(&self) -> bool {
        self.state.contains(TargetState::RUNNING)
    }

    /// `set_breakpoint` (C4): patches the code, allocates a table entry.
    pub fn set_breakpoint(&mut self, offset: u32, one_shot: bool) -> DbgResult<u32> {
        let addr = self.entry_pc.wrapping_add(offset);
        let image = self.image.as_ref().ok_or(DbgError::LoadFailed)?;
        let mut guard = image.lock().unwrap();
        let saved_opcode = guard.read_u16(addr).ok_or(DbgError::InvalidAddress)?;
        guard.write_u16(addr, TRAP_OPCODE)?;
        drop(guard);
        Ok(self.breakpoints.insert(addr, saved_opcode, one_shot))
    }

    pub fn clear_breakpoint(&mut self, id: u32) -> DbgResult<()> {
        let bp = self
            .breakpoints
            .find_by_id(id)
            .cloned()
            .ok_or(DbgError::UnknownBreakpoint)?;
        let image = self.image.as_ref().ok_or(DbgError::LoadFailed)?;
        image.lock().unwrap().write_u16(bp.addr, bp.saved_opcode)?;
        self.breakpoints.remove_by_id(id);
        if self.active_breakpoint == Some(id) {
            self.active_breakpoint = None;
        }
        Ok(())
    }

    /// `run_target` (C5 step 3): spawns the target task and drives the
    /// stop loop until the target becomes terminal (exits or errors) or
    /// is killed. `command_source` is invoked once per user-visible
    /// stop and decides how the target resumes.
    pub fn run(&mut self, command_source: &mut dyn crate::commands::CommandSource) -> DbgResult<()> {
        let image = self.image.clone().ok_or(DbgError::LoadFailed)?;
        self.breakpoints.reset_hit_counts();
        self.state = TargetState::RUNNING;
        self.exit_code = 0;
        self.error_code = None;

        let stop_signal = Signal::new();
        let resume_signal = Signal::new();
        let initial_ctx = TaskContext::new(self.initial_sp, self.entry_pc);
        let bridge = Arc::new(SignalBridge::new(
            stop_signal.clone(),
            resume_signal.clone(),
            initial_ctx,
        ));
        self.resume_signal = Some(resume_signal);

        let runtime = self.runtime.clone();
        let entry_pc = self.entry_pc;
        let bridge_for_task: Arc<dyn ExceptionBridge> = bridge.clone();
        let task_handle = self.os.spawn_task(
            "target",
            Box::new(move || {
                runtime.run(image, entry_pc, bridge_for_task);
            }),
        );
        self.task_handle = Some(task_handle);
        self.bridge = Some(bridge);

        loop {
            let bridge = self.bridge.clone().expect("bridge set for running target");
            let (ctx, reason) = bridge.await_stop();
            self.active_context = Some(ctx);

            if let Some(resumed_ctx) = self.classify_and_maybe_silently_resume(ctx, reason) {
                bridge.resume_with(resumed_ctx);
                continue;
            }

            if reason.is_terminal() {
                self.apply_terminal(reason);
            }

            let outcome = command_source.service(self);
            match outcome {
                ServiceOutcome::Resumed => {
                    let ctx = self.active_context.expect("context present while running");
                    bridge.resume_with(ctx);
                }
                ServiceOutcome::Killed => {
                    self.finish_kill();
                    return Ok(());
                }
                ServiceOutcome::Quit(code) => {
                    self.exit_code = code;
                    return Ok(());
                }
            }

            if reason.is_terminal() {
                if let Some(handle) = self.task_handle.take() {
                    self.os.join_task(handle);
                }
                return Ok(());
            }
        }
    }

    /// Applies stop classification (§4.6). Returns `Some(ctx)` if the
    /// stop should be silently resumed without invoking the command
    /// loop (the hidden re-arming single step after a breakpoint
    /// continue), `None` if the stop should be surfaced.
    fn classify_and_maybe_silently_resume(
        &mut self,
        mut ctx: TaskContext,
        reason: StopReason,
    ) -> Option<TaskContext> {
        self.state.clear_stop_reason();
        match reason {
            StopReason::Breakpoint => {
                let addr = ctx.pc.wrapping_sub(2);
                if let Some(bp) = self.breakpoints.find_by_addr(addr).cloned() {
                    let image = self.image.as_ref().expect("image present while running");
                    let _ = image.lock().unwrap().write_u16(addr, bp.saved_opcode);
                    if let Some(entry) = self.breakpoints.find_by_addr_mut(addr) {
                        entry.hit_count += 1;
                    }
                    ctx.pc = addr;
                    if bp.one_shot {
                        self.breakpoints.remove_by_id(bp.id);
                        self.active_breakpoint = None;
                        self.state.insert(TargetState::STOPPED_BY_ONESHOT_BP);
                    } else {
                        self.active_breakpoint = Some(bp.id);
                        self.state.insert(TargetState::STOPPED_BY_BP);
                    }
                } else {
                    log!(
                        LogLevel::Warn,
                        "trap at unknown address {:#x}, presenting as exception",
                        addr
                    );
                    self.state.insert(TargetState::STOPPED_BY_EXCEPTION);
                }
                self.active_context = Some(ctx);
                None
            }
            StopReason::SingleStep => {
                let mut rearmed = false;
                if let Some(bp_id) = self.active_breakpoint.take() {
                    if let Some(bp) = self.breakpoints.find_by_id(bp_id).cloned() {
                        let image = self.image.as_ref().expect("image present while running");
                        let _ = image.lock().unwrap().write_u16(bp.addr, TRAP_OPCODE);
                        rearmed = true;
                    }
                }
                if self.state.contains(TargetState::SINGLE_STEPPING) {
                    self.state.insert(TargetState::STOPPED_BY_SINGLE_STEP);
                    self.active_context = Some(ctx);
                    None
                } else {
                    // Hidden re-arming step requested by continue-mode;
                    // not user-visible. Clear trace bit and resume.
                    let _ = rearmed;
                    step::set_continue_mode(&mut ctx, self.active_breakpoint.is_some());
                    Some(ctx)
                }
            }
            StopReason::Exception(exc_num) => {
                ctx.exc_num = exc_num;
                self.state.insert(TargetState::STOPPED_BY_EXCEPTION);
                self.active_context = Some(ctx);
                None
            }
            StopReason::Exited(code) => {
                self.exit_code = code;
                self.active_context = Some(ctx);
                None
            }
            StopReason::Error(err) => {
                self.error_code = Some(err);
                self.active_context = Some(ctx);
                None
            }
        }
    }

    fn apply_terminal(&mut self, reason: StopReason) {
        match reason {
            StopReason::Exited(_) => {
                self.state.remove(TargetState::RUNNING);
                self.state.insert(TargetState::EXITED);
            }
            StopReason::Error(err) => {
                self.state.remove(TargetState::RUNNING);
                self.state.insert(TargetState::ERROR);
                self.error_code = Some(err);
            }
            _ => {}
        }
    }

    /// `set_continue_mode` (C7): mutates the staged context's `sr` and
    /// clears the user-visible single-stepping flag.
    pub fn continue_target(&mut self) {
        self.state.remove(TargetState::SINGLE_STEPPING);
        if let Some(ctx) = self.active_context.as_mut() {
            step::set_continue_mode(ctx, self.active_breakpoint.is_some());
        }
    }

    /// `set_single_step_mode` (C7).
    pub fn step_target(&mut self) {
        self.state.insert(TargetState::SINGLE_STEPPING);
        if let Some(ctx) = self.active_context.as_mut() {
            step::set_single_step_mode(ctx);
        }
    }

    /// `kill_target`: marks state, restores every installed
    /// breakpoint's original opcode best-effort (SPEC_FULL.md §9),
    /// forcibly (best-effort) removes the target task.
    pub fn kill(&mut self) {
        self.state.insert(TargetState::KILLED);
        self.state.remove(TargetState::RUNNING);
        if let Some(image) = &self.image {
            let mut guard = image.lock().unwrap();
            for bp in self.breakpoints.iter() {
                if let Err(e) = guard.write_u16(bp.addr, bp.saved_opcode) {
                    log!(
                        LogLevel::Warn,
                        "could not restore breakpoint {} during kill: {}",
                        bp.id,
                        e
                    );
                }
            }
        }
        // Signal resume so the target task is not left blocked forever;
        // it is allowed to keep running briefly, best-effort only.
        if let Some(resume_signal) = self.resume_signal.take() {
            resume_signal.send();
        }
    }

    fn finish_kill(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            self.os.remove_task(handle);
        }
    }

    pub fn get_target_info(&self) -> TargetInfo {
        let ctx = self.active_context.unwrap_or(TaskContext::new(self.initial_sp, self.entry_pc));
        let (next_instr_bytes, top_stack_dwords) = if self.state.contains(TargetState::RUNNING) {
            let next = self
                .image
                .as_ref()
                .map(|img| img.lock().unwrap().read_bytes_padded(ctx.pc, wire::NEXT_INSTR_BYTES_LEN))
                .unwrap_or_default();
            (next, vec![0u32; wire::TOP_STACK_DWORDS_LEN])
        } else {
            (Vec::new(), Vec::new())
        };
        let bpoint = self.active_breakpoint.and_then(|id| {
            self.breakpoints.find_by_id(id).map(|bp| BpointInfo {
                id: bp.id,
                addr: bp.addr,
                opcode: bp.saved_opcode,
                hit_count: bp.hit_count,
            })
        });
        TargetInfo {
            initial_pc: self.entry_pc,
            initial_sp: self.initial_sp,
            state: self.state.bits(),
            exit_code: self.exit_code,
            error_code: self.error_code.map(|e| e.code() as u32).unwrap_or(0),
            task_context: ctx,
            next_instr_bytes,
            top_stack_dwords,
            bpoint,
        }
    }

    pub fn disassemble_next(&self) -> Option<(String, usize)> {
        let ctx = self.active_context?;
        let image = self.image.as_ref()?;
        let guard = image.lock().unwrap();
        let bytes = guard.read_bytes(ctx.pc, 8).ok()?;
        Some(self.disassembler.disassemble(bytes, ctx.pc))
    }

    pub fn peek_memory(&self, addr: u32, len: usize) -> DbgResult<Vec<u8>> {
        let image = self.image.as_ref().ok_or(DbgError::LoadFailed)?;
        let guard = image.lock().unwrap();
        guard.read_bytes(addr, len).map(|b| b.to_vec())
    }

    pub fn poke_memory(&self, addr: u32, data: &[u8]) -> DbgResult<()> {
        let image = self.image.as_ref().ok_or(DbgError::LoadFailed)?;
        let mut guard = image.lock().unwrap();
        guard.write_bytes(addr, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FakeDisassembler, InMemoryLoader};
    use crate::commands::CommandSource;
    use crate::runtime::SimulatedTargetRuntime;

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

    /// Continues on every stop until the target exits, recording every
    /// stop's state bits for assertions.
    struct RecordingSource {
        stops: Vec<TargetState>,
        step_once_then_continue: bool,
    }

    impl CommandSource for RecordingSource {
        fn service(&mut self, target: &mut Target) -> ServiceOutcome {
            self.stops.push(target.state);
            if target.state.contains(TargetState::EXITED)
                || target.state.contains(TargetState::ERROR)
            {
                return ServiceOutcome::Quit(target.exit_code);
            }
            if self.step_once_then_continue && target.state.contains(TargetState::STOPPED_BY_BP) {
                target.step_target();
            } else {
                target.continue_target();
            }
            ServiceOutcome::Resumed
        }
    }

    #[test]
    fn breakpoint_hit_then_continue_to_exit() {
        // nop; nop; nop; trap; exit
        let code = vec![0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x40, 0x4E, 0x75];
        let mut target = new_target(code);
        target.load(Path::new("unused")).unwrap();
        let id = target.set_breakpoint(6, false).unwrap();
        assert_eq!(id, 1);

        let mut source = RecordingSource {
            stops: Vec::new(),
            step_once_then_continue: false,
        };
        target.run(&mut source).unwrap();

        assert!(source.stops[0].contains(TargetState::STOPPED_BY_BP));
        assert!(source.stops.last().unwrap().contains(TargetState::EXITED));
        assert_eq!(target.breakpoints.find_by_id(id).unwrap().hit_count, 1);
    }

    #[test]
    fn single_step_past_breakpoint_rearms_trap() {
        let code = vec![0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x40, 0x4E, 0x71, 0x4E, 0x75];
        let mut target = new_target(code);
        target.load(Path::new("unused")).unwrap();
        target.set_breakpoint(6, false).unwrap();

        let mut source = RecordingSource {
            stops: Vec::new(),
            step_once_then_continue: true,
        };
        target.run(&mut source).unwrap();

        // First stop: breakpoint hit. Second: the user-visible single
        // step landing past the restored instruction. Then continue to exit.
        assert!(source.stops[0].contains(TargetState::STOPPED_BY_BP));
        assert!(source.stops[1].contains(TargetState::STOPPED_BY_SINGLE_STEP));
        assert!(source.stops.last().unwrap().contains(TargetState::EXITED));

        let addr = target.entry_pc() + 6;
        let image = target.image.as_ref().unwrap();
        assert_eq!(image.lock().unwrap().read_u16(addr).unwrap(), TRAP_OPCODE);
    }

    #[test]
    fn one_shot_breakpoint_is_consumed_on_hit() {
        let code = vec![0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x40, 0x4E, 0x75];
        let mut target = new_target(code);
        target.load(Path::new("unused")).unwrap();
        let id = target.set_breakpoint(6, true).unwrap();

        let mut source = RecordingSource {
            stops: Vec::new(),
            step_once_then_continue: false,
        };
        target.run(&mut source).unwrap();

        assert!(source.stops[0].contains(TargetState::STOPPED_BY_ONESHOT_BP));
        assert!(target.breakpoints.find_by_id(id).is_none());
    }

    #[test]
    fn clear_breakpoint_restores_opcode() {
        let code = vec![0x4E, 0x71, 0x4E, 0x71];
        let mut target = new_target(code);
        target.load(Path::new("unused")).unwrap();
        let id = target.set_breakpoint(0, false).unwrap();
        let addr = target.entry_pc();
        {
            let image = target.image.as_ref().unwrap();
            assert_eq!(image.lock().unwrap().read_u16(addr).unwrap(), TRAP_OPCODE);
        }
        target.clear_breakpoint(id).unwrap();
        let image = target.image.as_ref().unwrap();
        assert_eq!(image.lock().unwrap().read_u16(addr).unwrap(), 0x4E71);
    }

    #[test]
    fn unknown_breakpoint_clear_is_error() {
        let mut target = new_target(vec![0x4E, 0x71]);
        target.load(Path::new("unused")).unwrap();
        assert_eq!(target.clear_breakpoint(999), Err(DbgError::UnknownBreakpoint));
    }
}
