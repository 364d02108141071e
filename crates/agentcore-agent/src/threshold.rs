use agentcore_core::config::{
    FALLBACK_AUTO_COMPACT_TOKENS, FALLBACK_ERROR_TOKENS, FALLBACK_WARNING_TOKENS,
};

/// Minimum AutoCompact threshold the formula is allowed to produce (spec
/// §4.3), below which the fallback triple is used instead.
const AUTO_COMPACT_FLOOR: u64 = 80_000;
const AUTO_COMPACT_CEILING: u64 = 500_000;
const ERROR_FLOOR: u64 = 50_000;
const WARNING_FLOOR: u64 = 40_000;
const DEFAULT_PROMPT_OVERHEAD: u64 = 20_000;

/// The three token thresholds that gate compaction for one run (spec §4.3).
/// Computed once per run from the active provider's context window and the
/// measured iteration-1 prompt overhead, then cached in `RunState` for the
/// remainder of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub warning: u64,
    pub error: u64,
    pub auto_compact: u64,
}

/// Compute thresholds for a run (spec §4.3).
///
/// `context_window` is the active model's context window in tokens, if
/// known. `prompt_overhead` is the measured token cost of the static
/// system prompt plus tool definitions on iteration 1, if already
/// measured; `None` before iteration 1 completes.
///
/// ```text
/// AutoCompact = clamp(context_window - max(prompt_overhead, 20000), 80000, 500000)
/// Error       = max(AutoCompact - 10000, 50000)
/// Warning     = max(AutoCompact - 20000, 40000)
/// ```
///
/// Falls back to the fixed `(60000, 70000, 80000)` triple when no context
/// window is known at all.
pub fn compute(context_window: Option<u64>, prompt_overhead: Option<u64>) -> Thresholds {
    let Some(context_window) = context_window else {
        return Thresholds {
            warning: FALLBACK_WARNING_TOKENS,
            error: FALLBACK_ERROR_TOKENS,
            auto_compact: FALLBACK_AUTO_COMPACT_TOKENS,
        };
    };

    let overhead = prompt_overhead.unwrap_or(0).max(DEFAULT_PROMPT_OVERHEAD);
    let auto_compact = context_window
        .saturating_sub(overhead)
        .clamp(AUTO_COMPACT_FLOOR, AUTO_COMPACT_CEILING);

    let error = auto_compact.saturating_sub(10_000).max(ERROR_FLOOR);
    let warning = auto_compact.saturating_sub(20_000).max(WARNING_FLOOR);

    Thresholds {
        warning,
        error,
        auto_compact,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_when_context_window_unknown() {
        let t = compute(None, Some(5_000));
        assert_eq!(t.warning, 60_000);
        assert_eq!(t.error, 70_000);
        assert_eq!(t.auto_compact, 80_000);
    }

    #[test]
    fn uses_measured_overhead_when_above_default() {
        let t = compute(Some(200_000), Some(50_000));
        assert_eq!(t.auto_compact, 150_000);
        assert_eq!(t.error, 140_000);
        assert_eq!(t.warning, 130_000);
    }

    #[test]
    fn clamps_overhead_to_default_when_small() {
        // overhead of 1000 is below the 20000 default floor, so the
        // default is used instead.
        let t = compute(Some(200_000), Some(1_000));
        assert_eq!(t.auto_compact, 180_000);
    }

    #[test]
    fn clamps_auto_compact_to_floor_for_small_context_windows() {
        let t = compute(Some(50_000), None);
        assert_eq!(t.auto_compact, AUTO_COMPACT_FLOOR);
        assert_eq!(t.error, ERROR_FLOOR);
        assert_eq!(t.warning, WARNING_FLOOR);
    }

    #[test]
    fn clamps_auto_compact_to_ceiling_for_huge_context_windows() {
        let t = compute(Some(10_000_000), Some(20_000));
        assert_eq!(t.auto_compact, AUTO_COMPACT_CEILING);
    }

    #[test]
    fn missing_prompt_overhead_still_applies_default_floor() {
        let t = compute(Some(200_000), None);
        assert_eq!(t.auto_compact, 180_000);
    }
}
