// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control of device worker threads.
//!
//! A [TaskHdl] is held by the worker itself, while the paired [TaskCtrl] is
//! kept by whoever drives the worker.  The controller may request that the
//! worker do a pass of work, hold (pause), resume, or exit.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;

pub type NotifyFn = dyn Fn() + Send + Sync + 'static;

#[derive(Default)]
struct Control {
    should_exit: bool,
    should_hold: bool,
    is_held: bool,
    work_pending: bool,
}

struct Inner {
    ctrl: Mutex<Control>,
    cv: Condvar,
    notify_fn: Option<Box<NotifyFn>>,
}
impl Inner {
    /// Call notifier function (if one exists) for task.
    ///
    /// The notifier may synchronously access resources which are exclusive of
    /// the `MutexGuard` held on the [`Control`], so the guard is dropped
    /// while calling it.
    fn notify_task<'a>(
        &'a self,
        guard: MutexGuard<'a, Control>,
    ) -> MutexGuard<'a, Control> {
        match self.notify_fn.as_ref() {
            Some(notify) if !guard.is_held => {
                drop(guard);
                notify();
                self.ctrl.lock().unwrap()
            }
            _ => guard,
        }
    }
}

/// Event observed by a worker waiting on its [TaskHdl].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Work was requested through [TaskCtrl::notify].
    Work,
    /// The controller asked the task to hold.
    Hold,
    /// The controller asked the task to exit.
    Exit,
    /// Nothing happened within the wait period.
    Timeout,
}

pub struct TaskHdl(Arc<Inner>);
impl TaskHdl {
    pub fn new(notify_fn: Option<Box<NotifyFn>>) -> (Self, TaskCtrl) {
        let inner = Arc::new(Inner {
            ctrl: Mutex::new(Control::default()),
            cv: Condvar::new(),
            notify_fn,
        });
        let ctrl = TaskCtrl(Arc::downgrade(&inner));
        (Self(inner), ctrl)
    }

    pub fn pending_event(&self) -> Option<Event> {
        let ctrl = self.0.ctrl.lock().unwrap();
        if ctrl.should_exit {
            Some(Event::Exit)
        } else if ctrl.should_hold {
            Some(Event::Hold)
        } else if ctrl.work_pending {
            Some(Event::Work)
        } else {
            None
        }
    }

    /// Wait up to `timeout` for an event.  A pending work request is consumed
    /// by observing it.
    pub fn wait(&self, timeout: Duration) -> Event {
        let guard = self.0.ctrl.lock().unwrap();
        let (mut guard, res) = self
            .0
            .cv
            .wait_timeout_while(guard, timeout, |g| {
                !(g.should_exit || g.should_hold || g.work_pending)
            })
            .unwrap();
        if guard.should_exit {
            Event::Exit
        } else if guard.should_hold {
            Event::Hold
        } else if guard.work_pending {
            guard.work_pending = false;
            Event::Work
        } else {
            assert!(res.timed_out());
            Event::Timeout
        }
    }

    /// Is `ctrl` the controller paired with this handle?
    pub fn is_controlled_by(&self, ctrl: &TaskCtrl) -> bool {
        std::ptr::eq(Weak::as_ptr(&ctrl.0), Arc::as_ptr(&self.0))
    }

    /// Block while a hold is requested, returning once the task is released
    /// or asked to exit.
    pub fn hold(&self) {
        let mut guard = self.0.ctrl.lock().unwrap();
        if guard.should_exit || !guard.should_hold {
            return;
        }
        assert!(!guard.is_held, "task already held");
        guard.is_held = true;
        let cv = &self.0.cv;
        cv.notify_all();
        let mut guard =
            cv.wait_while(guard, |g| g.should_hold && !g.should_exit).unwrap();
        guard.is_held = false;
        cv.notify_all();
    }
}

#[derive(Debug, Eq, PartialEq, Error)]
pub enum Error {
    #[error("task already exited")]
    Exited,
    #[error("task is marked to exit")]
    ExitInProgress,
    #[error("task marked to run while waiting for hold")]
    HoldInterrupted,
}

#[derive(Clone)]
pub struct TaskCtrl(Weak<Inner>);
impl TaskCtrl {
    /// Request that the task perform a pass of work.
    pub fn notify(&self) -> Result<(), Error> {
        let inner = self.0.upgrade().ok_or(Error::Exited)?;
        let mut guard = inner.ctrl.lock().unwrap();
        if guard.should_exit {
            return Err(Error::ExitInProgress);
        }
        guard.work_pending = true;
        inner.cv.notify_all();
        let _guard = inner.notify_task(guard);
        Ok(())
    }
    pub fn run(&mut self) -> Result<(), Error> {
        let inner = self.0.upgrade().ok_or(Error::Exited)?;
        let mut guard = inner.ctrl.lock().unwrap();
        if guard.should_exit {
            Err(Error::ExitInProgress)
        } else {
            guard.should_hold = false;
            inner.cv.notify_all();
            Ok(())
        }
    }
    /// Request a hold and wait for the task to acknowledge it.
    pub fn hold(&mut self) -> Result<(), Error> {
        let inner = self.0.upgrade().ok_or(Error::Exited)?;
        let mut guard = inner.ctrl.lock().unwrap();
        if guard.should_exit {
            return Err(Error::ExitInProgress);
        }
        guard.should_hold = true;
        inner.cv.notify_all();
        let guard = inner.notify_task(guard);
        let guard = inner
            .cv
            .wait_while(guard, |g| {
                (!g.is_held && g.should_hold) && !g.should_exit
            })
            .unwrap();
        if guard.should_exit {
            Err(Error::ExitInProgress)
        } else if !guard.should_hold {
            // Someone else swooped into to clear the hold
            Err(Error::HoldInterrupted)
        } else {
            Ok(())
        }
    }
    pub fn exit(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            let mut guard = inner.ctrl.lock().unwrap();
            guard.should_exit = true;
            inner.cv.notify_all();
            let _guard = inner.notify_task(guard);
        }
    }
}
