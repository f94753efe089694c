//! Cooperative task runtime of a driver process.
//!
//! Drivers follow the secretaries-and-directors arrangement of cooperating
//! sequential processes: the event loop is the secretary, and the worker
//! tasks spawned here are directors woken through [`Rendezvous`] objects.
//! All tasks share the one thread of the process; a task runs until it
//! awaits, so between suspension points it has exclusive access to the
//! process state and no locking is needed.
//!
//! [`Executor::drain`] is the secretary's "yield until nothing is runnable"
//! loop: it keeps polling runnable tasks until every task is parked on a
//! rendezvous (or finished).

mod rendezvous;
pub(crate) mod task;

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::task::Poll;

pub use self::rendezvous::{yield_now, Rendezvous, Sleep, YieldNow};
use self::task::AsyncTask;

#[derive(Default)]
pub struct Executor {
	tasks: RefCell<Vec<AsyncTask>>,
	incoming: RefCell<Vec<AsyncTask>>,
}

impl Executor {
	pub fn new() -> Rc<Self> {
		Rc::new(Self::default())
	}

	/// Creates a task and schedules it runnable. Tasks carry no handle;
	/// they are reached through the rendezvous they sleep on.
	pub fn spawn<F>(&self, future: F)
	where
		F: Future<Output = ()> + 'static,
	{
		self.incoming.borrow_mut().push(AsyncTask::new(future));
	}

	/// Polls runnable tasks until none remains runnable.
	///
	/// Returns the number of polls performed, zero when the call found
	/// every task already parked.
	pub fn drain(&self) -> usize {
		let mut polls = 0;

		loop {
			self.tasks
				.borrow_mut()
				.append(&mut self.incoming.borrow_mut());

			let mut progressed = false;
			self.tasks.borrow_mut().retain_mut(|task| {
				if !task.take_runnable() {
					return true;
				}
				progressed = true;
				polls += 1;
				trace!("run async task {}", task.id());

				match task.poll() {
					Poll::Ready(()) => false,
					Poll::Pending => true,
				}
			});

			if !progressed && self.incoming.borrow().is_empty() {
				break;
			}
		}

		polls
	}

	pub fn task_count(&self) -> usize {
		self.tasks.borrow().len() + self.incoming.borrow().len()
	}
}

#[cfg(test)]
mod tests {
	use std::cell::Cell;
	use std::rc::Rc;

	use super::*;

	#[test]
	fn drain_runs_spawned_tasks_to_completion() {
		let executor = Executor::new();
		let counter = Rc::new(Cell::new(0));

		for _ in 0..3 {
			let counter = counter.clone();
			executor.spawn(async move {
				counter.set(counter.get() + 1);
			});
		}

		executor.drain();
		assert_eq!(counter.get(), 3);
		assert_eq!(executor.task_count(), 0);
	}

	#[test]
	fn yield_now_lets_other_tasks_run() {
		let executor = Executor::new();
		let order = Rc::new(RefCell::new(Vec::new()));

		let first = order.clone();
		executor.spawn(async move {
			first.borrow_mut().push("a1");
			yield_now().await;
			first.borrow_mut().push("a2");
		});
		let second = order.clone();
		executor.spawn(async move {
			second.borrow_mut().push("b1");
		});

		executor.drain();
		assert_eq!(*order.borrow(), ["a1", "b1", "a2"]);
	}

	#[test]
	fn sleep_parks_until_wakeup() {
		let executor = Executor::new();
		let rendezvous = Rc::new(Rendezvous::new());
		let state = Rc::new(Cell::new(0));

		let (rendez, observed) = (rendezvous.clone(), state.clone());
		executor.spawn(async move {
			observed.set(1);
			rendez.sleep().await;
			observed.set(2);
		});

		executor.drain();
		assert_eq!(state.get(), 1);
		assert_eq!(rendezvous.waiter_count(), 1);

		// A drain without a wakeup must not run the parked task.
		assert_eq!(executor.drain(), 0);
		assert_eq!(state.get(), 1);

		rendezvous.wakeup();
		executor.drain();
		assert_eq!(state.get(), 2);
		assert_eq!(executor.task_count(), 0);
	}

	#[test]
	fn wakeup_all_wakes_every_waiter() {
		let executor = Executor::new();
		let rendezvous = Rc::new(Rendezvous::new());
		let woken = Rc::new(Cell::new(0));

		for _ in 0..4 {
			let (rendez, woken) = (rendezvous.clone(), woken.clone());
			executor.spawn(async move {
				rendez.sleep().await;
				woken.set(woken.get() + 1);
			});
		}

		executor.drain();
		assert_eq!(woken.get(), 0);

		rendezvous.wakeup();
		executor.drain();
		assert_eq!(woken.get(), 1);

		rendezvous.wakeup_all();
		executor.drain();
		assert_eq!(woken.get(), 4);
	}
}
