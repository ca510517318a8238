//! Target execution and the exception bridge (C5/C6), abstracted behind
//! traits because actual 68k instruction execution is provided by real
//! hardware and is out of this design's scope (SPEC_FULL.md §4.5.1).

use std::sync::{Arc, Mutex};

use crate::breakpoint::TRAP_OPCODE;
use crate::collaborators::LoadedImage;
use crate::error::DbgError;
use crate::os::Signal;
use crate::target::TaskContext;

/// One stop word hands back to the supervisor, exactly one per call to
/// the bridge (SPEC_FULL.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A `TRAP_OPCODE` fired; the supervisor classifies it against the
    /// breakpoint table by address.
    Breakpoint,
    /// The trace bit delivered a single-step exception.
    SingleStep,
    /// Any other exception, carrying the raw exception number.
    Exception(u32),
    Exited(i32),
    Error(DbgError),
}

impl StopReason {
    pub fn is_terminal(self) -> bool {
        matches!(self, StopReason::Exited(_) | StopReason::Error(_))
    }
}

/// Runs in the target task's trap-exception context. Captures the saved
/// register frame, hands it to the supervisor, and blocks until resumed
/// — the two-signal hand-off described in SPEC_FULL.md §4.5/§5.
pub trait ExceptionBridge: Send + Sync {
    /// Blocks until the supervisor processes the stop and signals
    /// resume, then returns the (possibly mutated) context. For
    /// terminal reasons (`Exited`/`Error`) returns immediately without
    /// waiting for a resume signal, since there is nothing left to
    /// resume.
    fn stop(&self, ctx: TaskContext, reason: StopReason) -> TaskContext;
}

/// Shared mailbox between bridge and supervisor. Per SPEC_FULL.md §9,
/// it is conceptually "lent to the bridge only while the supervisor is
/// blocked" — enforced here by the two signals alternating strictly,
/// not by the mutex (which only protects the brief read/write itself).
pub struct SignalBridge {
    shared: Arc<Mutex<(TaskContext, Option<StopReason>)>>,
    stop_signal: Signal,
    resume_signal: Signal,
}

impl SignalBridge {
    pub fn new(stop_signal: Signal, resume_signal: Signal, initial_ctx: TaskContext) -> SignalBridge {
        SignalBridge {
            shared: Arc::new(Mutex::new((initial_ctx, None))),
            stop_signal,
            resume_signal,
        }
    }

    /// Supervisor-side: waits for the next stop, returning the context
    /// and reason it was signaled with.
    pub fn await_stop(&self) -> (TaskContext, StopReason) {
        self.stop_signal.wait();
        let guard = self.shared.lock().unwrap();
        let (ctx, reason) = &*guard;
        (ctx.clone(), reason.expect("stop signaled without a reason"))
    }

    /// Supervisor-side: writes back the (possibly mutated) context and
    /// wakes the target task.
    pub fn resume_with(&self, ctx: TaskContext) {
        {
            let mut guard = self.shared.lock().unwrap();
            guard.0 = ctx;
            guard.1 = None;
        }
        self.resume_signal.send();
    }
}

impl ExceptionBridge for SignalBridge {
    fn stop(&self, ctx: TaskContext, reason: StopReason) -> TaskContext {
        {
            let mut guard = self.shared.lock().unwrap();
            guard.0 = ctx.clone();
            guard.1 = Some(reason);
        }
        self.stop_signal.send();
        if reason.is_terminal() {
            return ctx;
        }
        self.resume_signal.wait();
        let guard = self.shared.lock().unwrap();
        guard.0.clone()
    }
}

pub trait TargetRuntime: Send + Sync {
    /// Runs the target to completion (exit, fatal error, or forced
    /// kill), stopping at each trap via `bridge`. Returns once a
    /// terminal `StopReason` has been delivered.
    fn run(&self, image: Arc<Mutex<LoadedImage>>, entry_pc: u32, bridge: Arc<dyn ExceptionBridge>);
}

/// Real execution comes from the AmigaOS process created by
/// `CreateNewProcTags`/`RunCommand` on actual hardware; unavailable on a
/// development host, so this stub reports a spawn failure if invoked.
pub struct NativeTargetRuntime;

impl TargetRuntime for NativeTargetRuntime {
    fn run(&self, _image: Arc<Mutex<LoadedImage>>, entry_pc: u32, bridge: Arc<dyn ExceptionBridge>) {
        let ctx = TaskContext::new(0, entry_pc);
        bridge.stop(ctx, StopReason::Error(DbgError::SpawnFailed));
    }
}

/// `EXIT_OPCODE` stands in for `rts` at the end of a simulated program.
pub const EXIT_OPCODE: u16 = 0x4E75;

/// A deliberately tiny fetch/execute loop recognizing only
/// `TRAP_OPCODE` and `EXIT_OPCODE`; every other 16-bit word is treated
/// as a one-word no-op advancing `pc` by 2. Sufficient to reproduce
/// every scenario in SPEC_FULL.md §8, and used by tests and by the CLI
/// when no native backend is configured.
pub struct SimulatedTargetRuntime;

const TRAP_EXC_NUM: u32 = 0x20;
const TRACE_EXC_NUM: u32 = 0x09;

/// Trace-bit position within the saved status register, matching the
/// `0x8700` mask `set_continue_mode`/`set_single_step_mode` OR in
/// (SPEC_FULL.md §4.7): bit 0x8000 is the trace-enable bit this
/// simulation reads.
const SR_TRACE_BIT: u16 = 0x8000;

impl TargetRuntime for SimulatedTargetRuntime {
    fn run(&self, image: Arc<Mutex<LoadedImage>>, entry_pc: u32, bridge: Arc<dyn ExceptionBridge>) {
        let initial_sp = { image.lock().unwrap().initial_sp };
        let mut ctx = TaskContext::new(initial_sp, entry_pc);

        loop {
            let word = { image.lock().unwrap().read_u16(ctx.pc) };
            let word = match word {
                Some(w) => w,
                None => {
                    ctx = bridge.stop(ctx, StopReason::Error(DbgError::InvalidAddress));
                    return;
                }
            };

            if word == TRAP_OPCODE {
                ctx.pc = ctx.pc.wrapping_add(2);
                ctx.exc_num = TRAP_EXC_NUM;
                ctx = bridge.stop(ctx, StopReason::Breakpoint);
                continue;
            }

            if word == EXIT_OPCODE {
                bridge.stop(ctx, StopReason::Exited(0));
                return;
            }

            ctx.pc = ctx.pc.wrapping_add(2);

            if ctx.sr & SR_TRACE_BIT != 0 {
                ctx.exc_num = TRACE_EXC_NUM;
                ctx = bridge.stop(ctx, StopReason::SingleStep);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::Signal;

    fn image_with_code(code: Vec<u8>) -> Arc<Mutex<LoadedImage>> {
        Arc::new(Mutex::new(LoadedImage {
            entry_pc: 0x1000,
            initial_sp: 0x8000,
            code,
            handle: crate::collaborators::UnloadHandle(1),
        }))
    }

    #[test]
    fn simulated_runtime_stops_at_trap_then_exits() {
        // nop; nop; nop; trap; exit
        let code = vec![
            0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x71, 0x4E, 0x40, 0x4E, 0x75,
        ];
        let image = image_with_code(code);
        let stop_sig = Signal::new();
        let resume_sig = Signal::new();
        let bridge = Arc::new(SignalBridge::new(
            stop_sig.clone(),
            resume_sig.clone(),
            TaskContext::new(0x8000, 0x1000),
        ));
        let runtime = SimulatedTargetRuntime;
        let bridge_clone = bridge.clone() as Arc<dyn ExceptionBridge>;
        let handle = std::thread::spawn(move || {
            runtime.run(image, 0x1000, bridge_clone);
        });

        let (ctx, reason) = bridge.await_stop();
        assert_eq!(reason, StopReason::Breakpoint);
        assert_eq!(ctx.pc, 0x1008); // past the trap word
        bridge.resume_with(ctx);

        let (_ctx, reason) = bridge.await_stop();
        assert_eq!(reason, StopReason::Exited(0));

        handle.join().unwrap();
        let _ = resume_sig;
    }
}
