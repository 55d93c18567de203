// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Single-flight runtime acquisition.
//!
//! The gate moves `NotStarted | Failed -> InProgress` with a compare-and-swap
//! performed while holding the epoch lock, and installs a fresh shared
//! completion for that epoch in the same critical section. Exactly one caller
//! wins and runs the extraction; every other caller awaits the epoch's
//! shared future. The winner publishes the final state and the result
//! together, so a late caller either sees `Completed` or joins the epoch.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, instrument, warn};

use crate::bundle::{is_valid_runtime_dir, BundleSource};
use crate::error::{GateError, GateResult};
use crate::extract::BundleExtractor;
use crate::locator::RuntimeLocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtractionState {
	NotStarted = 0,
	InProgress = 1,
	Completed = 2,
	Failed = 3,
}

impl ExtractionState {
	fn from_u8(value: u8) -> Self {
		match value {
			1 => ExtractionState::InProgress,
			2 => ExtractionState::Completed,
			3 => ExtractionState::Failed,
			_ => ExtractionState::NotStarted,
		}
	}
}

/// The completion every caller of one epoch awaits.
pub type SharedAcquire = Shared<BoxFuture<'static, GateResult<PathBuf>>>;

/// Result of a non-blocking acquisition attempt.
pub enum Acquisition {
	Ready(PathBuf),
	/// Extraction is running on a background worker.
	Pending(SharedAcquire),
}

impl std::fmt::Debug for Acquisition {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Acquisition::Ready(dir) => f.debug_tuple("Ready").field(dir).finish(),
			Acquisition::Pending(_) => f.write_str("Pending"),
		}
	}
}

struct Epoch {
	number: u64,
	shared: SharedAcquire,
}

#[derive(Default)]
struct EpochSlot {
	counter: u64,
	current: Option<Epoch>,
	runtime_dir: Option<PathBuf>,
}

struct GateInner {
	state: AtomicU8,
	epoch: Mutex<EpochSlot>,
	source: BundleSource,
	extractor: Arc<dyn BundleExtractor>,
}

impl GateInner {
	fn lock(&self) -> MutexGuard<'_, EpochSlot> {
		self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn state(&self) -> ExtractionState {
		ExtractionState::from_u8(self.state.load(Ordering::Acquire))
	}
}

/// The caller that won the CAS. Publishes the epoch's result exactly once,
/// including when dropped without finishing.
struct Winner {
	inner: Arc<GateInner>,
	epoch: u64,
	sender: Option<oneshot::Sender<GateResult<PathBuf>>>,
}

impl Winner {
	fn run(mut self) {
		let result = extract_or_reuse(&self.inner.source, self.inner.extractor.as_ref());
		self.publish(result);
	}

	fn publish(&mut self, result: GateResult<PathBuf>) {
		let Some(sender) = self.sender.take() else {
			return;
		};
		{
			let mut slot = self.inner.lock();
			let current = slot.current.as_ref().map(|e| e.number) == Some(self.epoch);
			if current {
				match &result {
					Ok(dir) => {
						slot.runtime_dir = Some(dir.clone());
						self.inner
							.state
							.store(ExtractionState::Completed as u8, Ordering::Release);
					}
					Err(_) => {
						slot.runtime_dir = None;
						self.inner
							.state
							.store(ExtractionState::Failed as u8, Ordering::Release);
					}
				}
				slot.current = None;
			} else {
				debug!(epoch = self.epoch, "epoch superseded; not publishing state");
			}
		}
		match &result {
			Ok(dir) => info!(epoch = self.epoch, dir = %dir.display(), "runtime ready"),
			Err(e) => warn!(epoch = self.epoch, error = %e, "runtime extraction failed"),
		}
		let _ = sender.send(result);
	}
}

impl Drop for Winner {
	fn drop(&mut self) {
		if self.sender.is_some() {
			self.publish(Err(GateError::WorkerGone));
		}
	}
}

enum Begin {
	Ready(PathBuf),
	Wait(SharedAcquire),
	Run(Winner, SharedAcquire),
}

fn extract_or_reuse(source: &BundleSource, extractor: &dyn BundleExtractor) -> GateResult<PathBuf> {
	let signature = source.signature()?;
	let target = source.target_dir();
	if is_valid_runtime_dir(&target, &signature) {
		debug!(dir = %target.display(), "runtime bundle already extracted; skipping");
		return Ok(target);
	}
	extractor.extract(source, &target, &signature)?;
	if !is_valid_runtime_dir(&target, &signature) {
		return Err(GateError::InvalidBundle(format!(
			"extracted tree at {} is missing the entry script or dependencies",
			target.display()
		)));
	}
	Ok(target)
}

/// Owns the process-wide extraction state for one bundle.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RuntimeGate {
	inner: Arc<GateInner>,
}

impl std::fmt::Debug for RuntimeGate {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RuntimeGate")
			.field("state", &self.state())
			.field("source", &self.inner.source)
			.finish()
	}
}

impl RuntimeGate {
	pub fn new(source: BundleSource, extractor: Arc<dyn BundleExtractor>) -> Self {
		Self {
			inner: Arc::new(GateInner {
				state: AtomicU8::new(ExtractionState::NotStarted as u8),
				epoch: Mutex::new(EpochSlot::default()),
				source,
				extractor,
			}),
		}
	}

	pub fn state(&self) -> ExtractionState {
		self.inner.state()
	}

	pub fn source(&self) -> &BundleSource {
		&self.inner.source
	}

	fn begin(&self) -> Begin {
		let mut slot = self.inner.lock();
		loop {
			let observed = self.inner.state();
			match observed {
				ExtractionState::Completed => {
					if let Some(dir) = slot.runtime_dir.clone() {
						return Begin::Ready(dir);
					}
					self.inner
						.state
						.store(ExtractionState::NotStarted as u8, Ordering::Release);
				}
				ExtractionState::InProgress => {
					if let Some(epoch) = slot.current.as_ref() {
						return Begin::Wait(epoch.shared.clone());
					}
					self.inner
						.state
						.store(ExtractionState::NotStarted as u8, Ordering::Release);
				}
				ExtractionState::NotStarted | ExtractionState::Failed => {
					if self
						.inner
						.state
						.compare_exchange(
							observed as u8,
							ExtractionState::InProgress as u8,
							Ordering::AcqRel,
							Ordering::Acquire,
						)
						.is_err()
					{
						continue;
					}

					slot.counter += 1;
					let number = slot.counter;
					let (sender, receiver) = oneshot::channel();
					let shared = receiver
						.map(|result| result.unwrap_or(Err(GateError::WorkerGone)))
						.boxed()
						.shared();
					slot.current = Some(Epoch {
						number,
						shared: shared.clone(),
					});
					info!(epoch = number, retry = (observed == ExtractionState::Failed), "starting runtime extraction");
					let winner = Winner {
						inner: Arc::clone(&self.inner),
						epoch: number,
						sender: Some(sender),
					};
					return Begin::Run(winner, shared);
				}
			}
		}
	}

	/// Acquire from async code. The winner extracts on a blocking task.
	#[instrument(skip(self))]
	pub async fn acquire(&self) -> GateResult<PathBuf> {
		match self.begin() {
			Begin::Ready(dir) => Ok(dir),
			Begin::Wait(shared) => shared.await,
			Begin::Run(winner, shared) => {
				tokio::task::spawn_blocking(move || winner.run());
				shared.await
			}
		}
	}

	/// Acquire from a thread that may block. The winner extracts inline.
	pub fn acquire_blocking(&self) -> GateResult<PathBuf> {
		match self.begin() {
			Begin::Ready(dir) => Ok(dir),
			Begin::Wait(shared) => futures::executor::block_on(shared),
			Begin::Run(winner, shared) => {
				winner.run();
				futures::executor::block_on(shared)
			}
		}
	}

	/// Acquire from the presentation thread. Never blocks: if the runtime is
	/// not ready, extraction starts on a background thread and the caller
	/// gets a future to await.
	pub fn acquire_nonblocking(&self) -> Acquisition {
		match self.begin() {
			Begin::Ready(dir) => Acquisition::Ready(dir),
			Begin::Wait(shared) => Acquisition::Pending(shared),
			Begin::Run(winner, shared) => {
				let spawned = std::thread::Builder::new()
					.name("runtime-extract".to_string())
					.spawn(move || winner.run());
				if let Err(e) = spawned {
					// The closure (and the winner) was dropped, publishing WorkerGone.
					warn!(error = %e, "failed to spawn extraction thread");
				}
				Acquisition::Pending(shared)
			}
		}
	}

	/// Forget the extracted runtime; the next acquire re-validates and, if
	/// needed, re-extracts. Refused while an extraction is running, since a
	/// second winner would write into the same target directory. Returns
	/// whether the gate was cleared.
	pub fn clear(&self) -> bool {
		let mut slot = self.inner.lock();
		if self.inner.state() == ExtractionState::InProgress && slot.current.is_some() {
			warn!("runtime extraction in progress; not clearing");
			return false;
		}
		slot.current = None;
		slot.runtime_dir = None;
		self.inner
			.state
			.store(ExtractionState::NotStarted as u8, Ordering::Release);
		info!("runtime gate cleared");
		true
	}
}

impl RuntimeLocator for RuntimeGate {
	fn find_runtime_dir(&self) -> Option<PathBuf> {
		if self.state() != ExtractionState::Completed {
			return None;
		}
		self.inner.lock().runtime_dir.clone()
	}

	fn is_ready(&self) -> bool {
		self.find_runtime_dir().is_some()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bundle::ENTRY_SCRIPT;
	use crate::extract::tests::write_bundle;
	use crate::extract::ZipExtractor;
	use std::path::Path;
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	/// Counts physical extractions and delegates to zip.
	struct CountingExtractor {
		calls: AtomicUsize,
		delay: Duration,
	}

	impl CountingExtractor {
		fn new(delay: Duration) -> Arc<Self> {
			Arc::new(Self {
				calls: AtomicUsize::new(0),
				delay,
			})
		}
	}

	impl BundleExtractor for CountingExtractor {
		fn extract(&self, source: &BundleSource, target: &Path, signature: &str) -> GateResult<()> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			std::thread::sleep(self.delay);
			ZipExtractor.extract(source, target, signature)
		}
	}

	/// Fails the first `failures` calls.
	struct FailingExtractor {
		calls: AtomicUsize,
		failures: usize,
	}

	impl BundleExtractor for FailingExtractor {
		fn extract(&self, source: &BundleSource, target: &Path, signature: &str) -> GateResult<()> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst);
			if n < self.failures {
				return Err(GateError::InvalidBundle("disk full".to_string()));
			}
			ZipExtractor.extract(source, target, signature)
		}
	}

	fn fixture() -> (tempfile::TempDir, BundleSource) {
		let tmp = tempfile::tempdir().unwrap();
		let archive = tmp.path().join("bridge.zip");
		write_bundle(&archive);
		let source = BundleSource::new(&archive, "2.0.0", tmp.path().join("install"));
		(tmp, source)
	}

	/// **Test: Concurrent acquirers share one extraction**
	///
	/// N callers racing from `NotStarted` must trigger exactly one physical
	/// extraction and all observe the same directory.
	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrent_acquire_extracts_once() {
		let (_tmp, source) = fixture();
		let extractor = CountingExtractor::new(Duration::from_millis(100));
		let gate = RuntimeGate::new(source, extractor.clone());

		let handles: Vec<_> = (0..8)
			.map(|_| {
				let gate = gate.clone();
				tokio::spawn(async move { gate.acquire().await })
			})
			.collect();

		let mut dirs = Vec::new();
		for handle in handles {
			dirs.push(handle.await.unwrap().unwrap());
		}

		assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
		assert!(dirs.windows(2).all(|w| w[0] == w[1]));
		assert!(dirs[0].join(ENTRY_SCRIPT).is_file());
		assert_eq!(gate.state(), ExtractionState::Completed);
		assert_eq!(gate.find_runtime_dir(), Some(dirs[0].clone()));
	}

	#[test]
	fn test_concurrent_blocking_acquire_extracts_once() {
		let (_tmp, source) = fixture();
		let extractor = CountingExtractor::new(Duration::from_millis(50));
		let gate = RuntimeGate::new(source, extractor.clone());

		let threads: Vec<_> = (0..6)
			.map(|_| {
				let gate = gate.clone();
				std::thread::spawn(move || gate.acquire_blocking())
			})
			.collect();
		let dirs: Vec<PathBuf> = threads
			.into_iter()
			.map(|t| t.join().unwrap().unwrap())
			.collect();

		assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
		assert!(dirs.windows(2).all(|w| w[0] == w[1]));
	}

	/// **Test: Failure reaches every waiter, and the next call retries**
	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_failure_propagates_then_retries() {
		let (_tmp, source) = fixture();
		let extractor = Arc::new(FailingExtractor {
			calls: AtomicUsize::new(0),
			failures: 1,
		});
		let gate = RuntimeGate::new(source, extractor.clone());

		let (a, b) = tokio::join!(gate.acquire(), gate.acquire());
		assert!(matches!(a, Err(GateError::InvalidBundle(_))));
		assert!(matches!(b, Err(GateError::InvalidBundle(_))));
		assert_eq!(gate.state(), ExtractionState::Failed);
		assert!(!gate.is_ready());

		let dir = gate.acquire().await.unwrap();
		assert!(dir.join(ENTRY_SCRIPT).is_file());
		assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
		assert_eq!(gate.state(), ExtractionState::Completed);
	}

	/// **Test: The presentation-thread variant never blocks**
	///
	/// The first call returns `Pending` immediately; once the future
	/// completes the next call is `Ready` with the same directory.
	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_nonblocking_returns_pending_then_ready() {
		let (_tmp, source) = fixture();
		let extractor = CountingExtractor::new(Duration::from_millis(50));
		let gate = RuntimeGate::new(source, extractor.clone());

		let pending = match gate.acquire_nonblocking() {
			Acquisition::Pending(fut) => fut,
			other => panic!("expected pending, got {other:?}"),
		};
		let dir = pending.await.unwrap();

		match gate.acquire_nonblocking() {
			Acquisition::Ready(ready) => assert_eq!(ready, dir),
			other => panic!("expected ready, got {other:?}"),
		}
		assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
	}

	/// **Test: A valid existing tree skips extraction**
	#[test]
	fn test_existing_tree_is_reused() {
		let (_tmp, source) = fixture();
		let first = CountingExtractor::new(Duration::ZERO);
		RuntimeGate::new(source.clone(), first.clone())
			.acquire_blocking()
			.unwrap();
		assert_eq!(first.calls.load(Ordering::SeqCst), 1);

		let second = CountingExtractor::new(Duration::ZERO);
		let gate = RuntimeGate::new(source, second.clone());
		gate.acquire_blocking().unwrap();
		assert_eq!(second.calls.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn test_clear_resets_state() {
		let (_tmp, source) = fixture();
		let extractor = CountingExtractor::new(Duration::ZERO);
		let gate = RuntimeGate::new(source, extractor.clone());

		gate.acquire_blocking().unwrap();
		assert!(gate.is_ready());

		assert!(gate.clear());
		assert_eq!(gate.state(), ExtractionState::NotStarted);
		assert!(gate.find_runtime_dir().is_none());

		gate.acquire_blocking().unwrap();
		assert!(gate.is_ready());
		// The tree on disk is still valid, so the second pass reuses it.
		assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
	}

	/// **Test: Clearing mid-extraction is refused**
	///
	/// If clear reset the state while a winner was still extracting, the next
	/// acquire would start a second extraction into the same directory.
	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_clear_during_extraction_is_refused() {
		let (_tmp, source) = fixture();
		let extractor = CountingExtractor::new(Duration::from_millis(200));
		let gate = RuntimeGate::new(source, extractor.clone());

		let pending = match gate.acquire_nonblocking() {
			Acquisition::Pending(fut) => fut,
			other => panic!("expected pending, got {other:?}"),
		};
		assert!(!gate.clear());
		assert_eq!(gate.state(), ExtractionState::InProgress);

		let joined = match gate.acquire_nonblocking() {
			Acquisition::Pending(fut) => fut,
			other => panic!("expected pending, got {other:?}"),
		};
		let (first, second) = tokio::join!(pending, joined);
		assert_eq!(first.unwrap(), second.unwrap());
		assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
		assert_eq!(gate.state(), ExtractionState::Completed);

		assert!(gate.clear());
		assert!(!gate.is_ready());
	}
}
