use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// The queue through which workers hand shard scans back to the coordinator
pub(crate) struct ReadyQueue {
	inner: Mutex<Inner>,
	notify: Notify,
}

struct Inner {
	queue: VecDeque<usize>,
	cancelled: bool,
	expired: bool,
}

impl ReadyQueue {
	/// Create a queue able to hold every shard scan of a scan at once
	pub(crate) fn new(capacity: usize) -> Self {
		Self {
			inner: Mutex::new(Inner {
				queue: VecDeque::with_capacity(capacity),
				cancelled: false,
				expired: false,
			}),
			notify: Notify::new(),
		}
	}

	/// Add a shard scan to the queue and wake the coordinator
	pub(crate) fn enqueue(&self, id: usize) {
		self.inner.lock().queue.push_back(id);
		self.notify.notify_one();
	}

	/// Stop handing out entries, waking the coordinator
	pub(crate) fn cancel(&self) {
		self.inner.lock().cancelled = true;
		self.notify.notify_one();
	}

	/// Stop handing out entries because the scan deadline has passed
	pub(crate) fn expire(&self) {
		self.inner.lock().expired = true;
		self.notify.notify_one();
	}

	pub(crate) fn len(&self) -> usize {
		self.inner.lock().queue.len()
	}

	/// Wait for the next shard scan. Returns nothing once the queue has been
	/// cancelled or has expired.
	pub(crate) async fn pop(&self) -> Option<usize> {
		loop {
			let notified = self.notify.notified();
			{
				let mut inner = self.inner.lock();
				if inner.cancelled || inner.expired {
					return None;
				}
				if let Some(id) = inner.queue.pop_front() {
					return Some(id);
				}
			}
			notified.await;
		}
	}
}
