//! Single-step manager (C7): resume-mode bit twiddling on the saved
//! status register. Grounded on cwdbg `server/target.c`
//! (`set_continue_mode` / `set_single_step_mode`).

use crate::target::TaskContext;

/// Bits 0x8700: trace-on-any-instruction plus masking all maskable
/// interrupts, so the trace exception cannot land inside an interrupt
/// handler instead of user code (SPEC_FULL.md §4.7).
const TRACE_AND_MASK_BITS: u16 = 0x8700;
const CLEAR_TRACE_MASK: u16 = 0xBFFF;

/// Clears the trace bit unconditionally; re-sets the trace-and-mask
/// bits only if a breakpoint's original instruction still needs to be
/// re-executed and re-armed (`has_active_breakpoint`).
pub fn set_continue_mode(ctx: &mut TaskContext, has_active_breakpoint: bool) {
    ctx.sr &= CLEAR_TRACE_MASK;
    if has_active_breakpoint {
        ctx.sr |= TRACE_AND_MASK_BITS;
    }
}

/// Always arms tracing, regardless of whether a breakpoint is active.
pub fn set_single_step_mode(ctx: &mut TaskContext) {
    ctx.sr &= CLEAR_TRACE_MASK;
    ctx.sr |= TRACE_AND_MASK_BITS;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_without_active_breakpoint_clears_trace() {
        let mut ctx = TaskContext::new(0, 0);
        ctx.sr = 0x8700;
        set_continue_mode(&mut ctx, false);
        assert_eq!(ctx.sr & 0x8000, 0);
    }

    #[test]
    fn continue_with_active_breakpoint_sets_trace_and_mask() {
        let mut ctx = TaskContext::new(0, 0);
        ctx.sr = 0x0000;
        set_continue_mode(&mut ctx, true);
        assert_eq!(ctx.sr, 0x8700);
    }

    #[test]
    fn single_step_always_sets_trace_and_mask() {
        let mut ctx = TaskContext::new(0, 0);
        ctx.sr = 0xFFFF;
        set_single_step_mode(&mut ctx);
        assert_eq!(ctx.sr, (0xFFFF & CLEAR_TRACE_MASK) | TRACE_AND_MASK_BITS);
    }
}
