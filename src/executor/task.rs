use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct AsyncTaskId(u32);

impl fmt::Display for AsyncTaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl AsyncTaskId {
	fn new() -> Self {
		static NEXT_ID: AtomicU32 = AtomicU32::new(0);
		AsyncTaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
	}
}

/// Wakeup flag behind a task's `Waker`.
///
/// A rendezvous stores clones of the waker; waking marks the task runnable
/// for the next drain pass of the executor.
struct TaskNotify {
	runnable: AtomicBool,
}

impl Wake for TaskNotify {
	fn wake(self: Arc<Self>) {
		self.wake_by_ref()
	}

	fn wake_by_ref(self: &Arc<Self>) {
		self.runnable.store(true, Ordering::Relaxed);
	}
}

pub(crate) struct AsyncTask {
	id: AsyncTaskId,
	future: Pin<Box<dyn Future<Output = ()>>>,
	notify: Arc<TaskNotify>,
}

impl AsyncTask {
	pub fn new(future: impl Future<Output = ()> + 'static) -> AsyncTask {
		AsyncTask {
			id: AsyncTaskId::new(),
			future: Box::pin(future),
			notify: Arc::new(TaskNotify {
				runnable: AtomicBool::new(true),
			}),
		}
	}

	pub fn id(&self) -> impl fmt::Display {
		self.id
	}

	/// Clears and returns the runnable flag.
	pub fn take_runnable(&self) -> bool {
		self.notify.runnable.swap(false, Ordering::Relaxed)
	}

	pub fn poll(&mut self) -> Poll<()> {
		let waker = Waker::from(self.notify.clone());
		let mut cx = Context::from_waker(&waker);
		self.future.as_mut().poll(&mut cx)
	}
}
