//! Sub-operation progress of C-MOVE and C-GET.

use crate::dimse::SubOperationCounters;
use serde::Serialize;

/// A snapshot of the sub-operation counters reported by the peer.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct RetrieveProgress {
	pub remaining: u16,
	pub completed: u16,
	pub failed: u16,
	pub warning: u16,
}

impl RetrieveProgress {
	pub const fn total(&self) -> u32 {
		self.remaining as u32 + self.completed as u32 + self.failed as u32 + self.warning as u32
	}

	/// Share of finished sub-operations, regardless of their outcome. 0 when nothing is known.
	pub fn fraction_complete(&self) -> f64 {
		let total = self.total();
		if total == 0 {
			return 0.0;
		}
		let done = u32::from(self.completed) + u32::from(self.failed) + u32::from(self.warning);
		f64::from(done) / f64::from(total)
	}

	pub const fn is_complete(&self) -> bool {
		self.remaining == 0
	}

	pub const fn has_failures(&self) -> bool {
		self.failed > 0
	}
}

impl From<SubOperationCounters> for RetrieveProgress {
	/// Absent counters count as 0.
	fn from(counters: SubOperationCounters) -> Self {
		Self {
			remaining: counters.remaining.unwrap_or_default(),
			completed: counters.completed.unwrap_or_default(),
			failed: counters.failed.unwrap_or_default(),
			warning: counters.warning.unwrap_or_default(),
		}
	}
}

/// Receives each progress snapshot in arrival order.
pub trait ProgressHandler {
	fn on_progress(&mut self, progress: &RetrieveProgress);
}

impl<F: FnMut(&RetrieveProgress)> ProgressHandler for F {
	fn on_progress(&mut self, progress: &RetrieveProgress) {
		self(progress);
	}
}

/// Ignores progress.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoProgress;

impl ProgressHandler for NoProgress {
	fn on_progress(&mut self, _progress: &RetrieveProgress) {}
}

/// Keeps the latest snapshot. The peer's counters are authoritative, nothing is accumulated.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
	latest: RetrieveProgress,
}

impl ProgressAggregator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records the counters of a Pending response and returns the new snapshot.
	pub fn pending(&mut self, counters: SubOperationCounters) -> RetrieveProgress {
		self.latest = RetrieveProgress::from(counters);
		self.latest
	}

	/// Records the counters of the final response. Peers may omit them there, in which case
	/// the last Pending snapshot stands with `remaining` cleared.
	pub fn finish(&mut self, counters: SubOperationCounters) -> RetrieveProgress {
		if counters.is_empty() {
			self.latest.remaining = 0;
		} else {
			self.latest = RetrieveProgress::from(counters);
		}
		self.latest
	}

	pub const fn latest(&self) -> RetrieveProgress {
		self.latest
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn derived_fields_when_done() {
		let progress = RetrieveProgress {
			remaining: 0,
			completed: 100,
			failed: 0,
			warning: 0,
		};
		assert_eq!(progress.total(), 100);
		assert!((progress.fraction_complete() - 1.0).abs() < f64::EPSILON);
		assert!(progress.is_complete());
		assert!(!progress.has_failures());
	}

	#[test]
	fn derived_fields_in_flight() {
		let progress = RetrieveProgress {
			remaining: 10,
			completed: 40,
			failed: 5,
			warning: 5,
		};
		assert_eq!(progress.total(), 60);
		assert!((progress.fraction_complete() - 50.0 / 60.0).abs() < 1e-9);
		assert!(!progress.is_complete());
		assert!(progress.has_failures());
	}

	#[test]
	fn empty_progress() {
		let progress = RetrieveProgress::default();
		assert_eq!(progress.total(), 0);
		assert!(progress.fraction_complete().abs() < f64::EPSILON);
	}

	#[test]
	fn total_does_not_overflow() {
		let progress = RetrieveProgress {
			remaining: u16::MAX,
			completed: u16::MAX,
			failed: 0,
			warning: 0,
		};
		assert_eq!(progress.total(), 2 * u32::from(u16::MAX));
	}

	#[test]
	fn missing_counters_count_as_zero() {
		let mut aggregator = ProgressAggregator::new();
		let snapshot = aggregator.pending(SubOperationCounters {
			remaining: Some(3),
			completed: None,
			failed: Some(1),
			warning: None,
		});
		assert_eq!(
			snapshot,
			RetrieveProgress {
				remaining: 3,
				completed: 0,
				failed: 1,
				warning: 0
			}
		);
	}

	#[test]
	fn keeps_only_the_latest_snapshot() {
		let mut aggregator = ProgressAggregator::new();
		aggregator.pending(SubOperationCounters {
			remaining: Some(2),
			completed: Some(1),
			failed: Some(0),
			warning: Some(0),
		});
		aggregator.pending(SubOperationCounters {
			remaining: Some(1),
			completed: Some(2),
			failed: Some(0),
			warning: Some(0),
		});
		let last = aggregator.finish(SubOperationCounters::default());
		assert_eq!(
			last,
			RetrieveProgress {
				remaining: 0,
				completed: 2,
				failed: 0,
				warning: 0
			}
		);
	}

	#[test]
	fn closures_are_progress_handlers() {
		let mut seen = Vec::new();
		let mut handler = |progress: &RetrieveProgress| seen.push(progress.completed);
		handler.on_progress(&RetrieveProgress {
			completed: 4,
			..RetrieveProgress::default()
		});
		assert_eq!(seen, vec![4]);
	}
}
