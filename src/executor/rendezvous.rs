//! Rendezvous objects: the synchronisation primitive of the task runtime.
//!
//! A rendezvous is a condition variable identified by the object itself
//! (where the C forerunners key on an address). `sleep().await` suspends the
//! current task until another task or the event loop calls [`wakeup`] or
//! [`wakeup_all`] on the same rendezvous. There is no ordering guarantee
//! among waiters and wakeups are not sticky: a wakeup with no waiter is lost,
//! so sleepers always re-check their predicate in a loop.
//!
//! [`wakeup`]: Rendezvous::wakeup
//! [`wakeup_all`]: Rendezvous::wakeup_all

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

#[derive(Debug, Default)]
pub struct Rendezvous {
	waiters: RefCell<Vec<Waker>>,
}

impl Rendezvous {
	pub const fn new() -> Self {
		Self {
			waiters: RefCell::new(Vec::new()),
		}
	}

	/// Suspends the current task until the next wakeup.
	pub fn sleep(&self) -> Sleep<'_> {
		Sleep {
			rendezvous: self,
			registered: false,
		}
	}

	/// Marks one arbitrary waiter runnable.
	pub fn wakeup(&self) {
		if let Some(waker) = self.waiters.borrow_mut().pop() {
			waker.wake();
		}
	}

	/// Marks every waiter runnable.
	pub fn wakeup_all(&self) {
		for waker in self.waiters.borrow_mut().drain(..) {
			waker.wake();
		}
	}

	#[cfg(test)]
	pub(crate) fn waiter_count(&self) -> usize {
		self.waiters.borrow().len()
	}
}

pub struct Sleep<'a> {
	rendezvous: &'a Rendezvous,
	registered: bool,
}

impl Future for Sleep<'_> {
	type Output = ();

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
		if self.registered {
			// Only a wakeup on the rendezvous re-polls this future.
			Poll::Ready(())
		} else {
			self.rendezvous.waiters.borrow_mut().push(cx.waker().clone());
			self.registered = true;
			Poll::Pending
		}
	}
}

/// Returns control to the scheduler once, like the C runtime's `taskyield`.
pub fn yield_now() -> YieldNow {
	YieldNow { yielded: false }
}

pub struct YieldNow {
	yielded: bool,
}

impl Future for YieldNow {
	type Output = ();

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
		if self.yielded {
			Poll::Ready(())
		} else {
			self.yielded = true;
			cx.waker().wake_by_ref();
			Poll::Pending
		}
	}
}
