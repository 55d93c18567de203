// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Trailing-edge throttle with a single owned timer.
//!
//! A request arriving at least one interval after the previous emission
//! fires immediately. A request inside the interval arms the timer (if it is
//! not armed already) to fire once at the interval boundary, so bursts
//! collapse into one emission per interval and the last request is never
//! lost. [`Throttle::flush`] fires now and disarms the timer;
//! [`Throttle::cancel`] disarms without firing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

type Emit = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ThrottleState {
	last_emit: Option<Instant>,
	timer: Option<JoinHandle<()>>,
	/// Bumped by flush and cancel so a timer that already woke up can tell
	/// it lost the race.
	generation: u64,
}

#[derive(Clone)]
pub struct Throttle {
	interval: Duration,
	emit: Emit,
	state: Arc<Mutex<ThrottleState>>,
}

impl std::fmt::Debug for Throttle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Throttle")
			.field("interval", &self.interval)
			.field("pending", &self.is_pending())
			.finish()
	}
}

impl Throttle {
	/// `emit` runs on the caller's thread for immediate emissions and on a
	/// tokio task for deferred ones.
	pub fn new(interval: Duration, emit: impl Fn() + Send + Sync + 'static) -> Self {
		Self {
			interval,
			emit: Arc::new(emit),
			state: Arc::new(Mutex::new(ThrottleState::default())),
		}
	}

	pub fn interval(&self) -> Duration {
		self.interval
	}

	fn lock(&self) -> MutexGuard<'_, ThrottleState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn is_pending(&self) -> bool {
		self.lock().timer.is_some()
	}

	/// Ask for an emission. Requires a tokio runtime when deferring.
	pub fn request(&self) {
		let now = Instant::now();
		{
			let mut state = self.lock();
			if state.timer.is_some() {
				return;
			}
			let due = state.last_emit.map(|last| last + self.interval);
			match due {
				Some(due) if due > now => {
					let generation = state.generation;
					let this = self.clone();
					state.timer = Some(tokio::spawn(async move {
						tokio::time::sleep_until(due).await;
						this.fire_deferred(generation);
					}));
					return;
				}
				_ => state.last_emit = Some(now),
			}
		}
		(self.emit)();
	}

	fn fire_deferred(&self, generation: u64) {
		{
			let mut state = self.lock();
			if state.generation != generation {
				return;
			}
			state.timer = None;
			state.last_emit = Some(Instant::now());
		}
		(self.emit)();
	}

	/// Emit now and disarm any pending timer.
	pub fn flush(&self) {
		self.disarm(true);
		(self.emit)();
	}

	/// Disarm any pending timer without emitting.
	pub fn cancel(&self) {
		self.disarm(false);
	}

	fn disarm(&self, emitted: bool) {
		let mut state = self.lock();
		state.generation = state.generation.wrapping_add(1);
		if let Some(timer) = state.timer.take() {
			timer.abort();
		}
		state.last_emit = if emitted { Some(Instant::now()) } else { None };
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn counting(interval: Duration) -> (Throttle, Arc<AtomicUsize>) {
		let count = Arc::new(AtomicUsize::new(0));
		let c = Arc::clone(&count);
		let throttle = Throttle::new(interval, move || {
			c.fetch_add(1, Ordering::SeqCst);
		});
		(throttle, count)
	}

	#[tokio::test(start_paused = true)]
	async fn test_first_request_fires_immediately() {
		let (throttle, count) = counting(DEFAULT_INTERVAL);
		throttle.request();
		assert_eq!(count.load(Ordering::SeqCst), 1);
		assert!(!throttle.is_pending());
	}

	/// **Test: A burst collapses into one trailing emission**
	///
	/// Requests inside the interval are deferred to fire exactly once at the
	/// boundary, bounding the update rate without losing the last request.
	#[tokio::test(start_paused = true)]
	async fn test_burst_collapses_to_trailing_emit() {
		let (throttle, count) = counting(DEFAULT_INTERVAL);
		throttle.request();
		for _ in 0..20 {
			tokio::time::advance(Duration::from_millis(1)).await;
			throttle.request();
		}
		assert_eq!(count.load(Ordering::SeqCst), 1);
		assert!(throttle.is_pending());

		tokio::time::sleep(Duration::from_millis(31)).await;
		tokio::task::yield_now().await;
		assert_eq!(count.load(Ordering::SeqCst), 2);
		assert!(!throttle.is_pending());

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(count.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_request_after_interval_fires_immediately() {
		let (throttle, count) = counting(DEFAULT_INTERVAL);
		throttle.request();
		tokio::time::advance(Duration::from_millis(60)).await;
		throttle.request();
		assert_eq!(count.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_flush_fires_and_disarms() {
		let (throttle, count) = counting(DEFAULT_INTERVAL);
		throttle.request();
		throttle.request();
		assert!(throttle.is_pending());

		throttle.flush();
		assert_eq!(count.load(Ordering::SeqCst), 2);
		assert!(!throttle.is_pending());

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(count.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_cancel_drops_pending_emit() {
		let (throttle, count) = counting(DEFAULT_INTERVAL);
		throttle.request();
		throttle.request();
		throttle.cancel();

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(count.load(Ordering::SeqCst), 1);

		throttle.request();
		assert_eq!(count.load(Ordering::SeqCst), 2);
	}
}
