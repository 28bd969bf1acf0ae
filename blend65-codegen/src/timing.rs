//! Pass timing.
//!
//! Scoped timers per compiler pass, accumulated in thread-local storage.
//! Start a pass with [`start_pass`] and keep the token alive for its
//! duration; [`take_summary`] renders and resets the table. The overhead
//! is a clock read per pass, cheap enough to stay on in release builds.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

thread_local! {
    static TOTALS: RefCell<Vec<(&'static str, Duration, u32)>> = RefCell::new(Vec::new());
}

/// A running pass timer. Stops when dropped.
pub struct TimingToken {
    name: &'static str,
    started: Instant,
}

impl Drop for TimingToken {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        TOTALS.with(|totals| {
            let mut totals = totals.borrow_mut();
            match totals.iter_mut().find(|(n, _, _)| *n == self.name) {
                Some((_, total, count)) => {
                    *total += elapsed;
                    *count += 1;
                }
                None => totals.push((self.name, elapsed, 1)),
            }
        });
    }
}

/// Start timing the named pass.
pub fn start_pass(name: &'static str) -> TimingToken {
    TimingToken {
        name,
        started: Instant::now(),
    }
}

/// Render the accumulated table and reset it.
///
/// Rows appear in first-start order, so the table doubles as a record of
/// the pass schedule.
pub fn take_summary() -> String {
    TOTALS.with(|totals| {
        let mut totals = totals.borrow_mut();
        let mut out = String::from("======== ========  ==================================\n");
        let _ = writeln!(out, "{:>8} {:>8}  Pass", "Total ms", "Runs");
        let _ = writeln!(out, "-------- --------  ----------------------------------");
        for (name, total, count) in totals.iter() {
            let _ = writeln!(out, "{:>8.3} {:>8}  {}", total.as_secs_f64() * 1e3, count, name);
        }
        totals.clear();
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_resets() {
        {
            let _t = start_pass("lexing");
        }
        {
            let _t = start_pass("lexing");
        }
        {
            let _t = start_pass("parsing");
        }
        let summary = take_summary();
        assert!(summary.contains("lexing"));
        assert!(summary.contains("parsing"));
        // Reset: a fresh summary has no rows.
        let empty = take_summary();
        assert!(!empty.contains("lexing"));
    }
}
