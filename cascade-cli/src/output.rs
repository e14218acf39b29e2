// Terminal rendering for workflow commands

use std::fmt::Display;
use std::time::Duration;

use cascade_engine::{RunPhase, UnitStatus};

const BAR_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy)]
enum Tone {
    Strong,
    Muted,
    Good,
    Bad,
    Caution,
    Accent,
}

impl Tone {
    fn code(self) -> &'static str {
        match self {
            Tone::Strong => "1",
            Tone::Muted => "2",
            Tone::Good => "32",
            Tone::Bad => "31",
            Tone::Caution => "33",
            Tone::Accent => "36",
        }
    }
}

fn paint(tone: Tone, text: impl Display) -> String {
    format!("\x1b[{}m{}\x1b[0m", tone.code(), text)
}

/// Tone and mark for a finished unit
fn status_mark(status: UnitStatus) -> (Tone, &'static str) {
    match status {
        UnitStatus::Completed => (Tone::Good, "done"),
        UnitStatus::Failed => (Tone::Bad, "failed"),
        UnitStatus::Idle => (Tone::Caution, "waiting"),
        UnitStatus::Running => (Tone::Accent, "running"),
        UnitStatus::Disabled => (Tone::Muted, "disabled"),
    }
}

/// Right-aligned label followed by a message, e.g. `  Restored run-state.json`
pub fn notice(label: &str, message: impl Display) {
    eprintln!("{} {}", paint(Tone::Accent, format!("{:>10}", label)), message);
}

pub fn title(message: impl Display) {
    eprintln!("{}", paint(Tone::Strong, message));
}

pub fn passed(message: impl Display) {
    eprintln!("  {} {}", paint(Tone::Good, "ok"), message);
}

pub fn problem(message: impl Display) {
    eprintln!("{} {}", paint(Tone::Bad, "error:"), message);
}

pub fn caution(message: impl Display) {
    eprintln!("  {} {}", paint(Tone::Caution, "!"), message);
}

pub fn hint(message: impl Display) {
    eprintln!("  {} {}", paint(Tone::Accent, "hint:"), message);
}

pub fn detail(message: impl Display) {
    eprintln!("{}", paint(Tone::Muted, message));
}

pub fn run_banner(run_id: &str, iteration: u32, groups: usize, parallel: bool) {
    let mode = if parallel { "parallel" } else { "sequential" };
    eprintln!();
    eprintln!(
        "{} {} {}",
        paint(Tone::Strong, format!("run {}", run_id)),
        paint(Tone::Accent, format!("#{}", iteration)),
        paint(Tone::Muted, format!("{} groups, {}", groups, mode)),
    );
}

pub fn phase(to: RunPhase) {
    eprintln!("{}", paint(Tone::Muted, format!("  -- {} --", to)));
}

pub fn group_started(id: &str, modules: usize) {
    eprintln!(
        "  {} {}",
        paint(Tone::Strong, id),
        paint(Tone::Muted, format!("({} modules)", modules))
    );
}

pub fn module_started(id: &str) {
    eprintln!("    {} {}", paint(Tone::Muted, ">"), id);
}

/// Status line for a finished group (`depth` 1) or module (`depth` 2)
pub fn unit_finished(depth: usize, id: &str, status: UnitStatus, duration: Duration) {
    let (tone, mark) = status_mark(status);
    eprintln!(
        "{}{} {} {}",
        "  ".repeat(depth),
        id,
        paint(tone, mark),
        paint(Tone::Muted, format!("{:.2}s", duration.as_secs_f64()))
    );
}

pub fn module_progress(id: &str, percent: u8) {
    let filled = usize::from(percent.min(100)) * BAR_WIDTH / 100;
    eprintln!(
        "      {} [{}{}] {:>3}%",
        paint(Tone::Muted, id),
        paint(Tone::Accent, "#".repeat(filled)),
        " ".repeat(BAR_WIDTH - filled),
        percent
    );
}

/// Announce a breakpoint; `waits` when the run holds for Enter
pub fn breakpoint(id: &str, waits: bool) {
    let action = if waits {
        "press Enter to continue"
    } else {
        "continuing"
    };
    eprintln!(
        "  {} {} {}",
        paint(Tone::Caution, "breakpoint"),
        id,
        paint(Tone::Muted, format!("({})", action))
    );
}

pub fn skipped(id: &str, reason: &str) {
    eprintln!("  {} {} {}", paint(Tone::Caution, "skip"), id, paint(Tone::Muted, reason));
}

/// A group left idle and what it still waits on
pub fn waiting(id: &str, pending: &[&str]) {
    let (tone, mark) = status_mark(UnitStatus::Idle);
    eprintln!("  {} {} on {}", id, paint(tone, mark), pending.join(", "));
}

pub fn pass_result(complete: bool, message: impl Display) {
    eprintln!();
    let (tone, mark) = if complete {
        status_mark(UnitStatus::Completed)
    } else {
        (Tone::Bad, "stalled")
    };
    eprintln!("{} {}", paint(tone, mark), message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paint_wraps_in_reset() {
        assert_eq!(paint(Tone::Good, "ok"), "\x1b[32mok\x1b[0m");
    }

    #[test]
    fn test_status_marks() {
        assert_eq!(status_mark(UnitStatus::Completed).1, "done");
        assert_eq!(status_mark(UnitStatus::Failed).1, "failed");
        assert_eq!(status_mark(UnitStatus::Idle).1, "waiting");
    }
}
