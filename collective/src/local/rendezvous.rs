use crate::TransportError;
use log::warn;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Reusable barrier that fails instead of hanging once a member leaves.
pub(super) struct Rendezvous {
    size: usize,
    state: Mutex<State>,
    cond: Condvar,
}

struct State {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

impl Rendezvous {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(State {
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.aborted {
            return Err(TransportError::RemoteError);
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner)
        }
        if state.generation != generation {
            Ok(())
        } else {
            warn!("rendezvous aborted with {} of {} arrived", state.arrived, self.size);
            Err(TransportError::RemoteError)
        }
    }

    pub fn abort(&self) {
        self.lock().aborted = true;
        self.cond.notify_all()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_reuse() {
        let rendezvous = Arc::new(Rendezvous::new(3));
        let handles = (0..3)
            .map(|_| {
                let r = rendezvous.clone();
                thread::spawn(move || (0..100).try_for_each(|_| r.wait()))
            })
            .collect::<Vec<_>>();
        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(()))
        }
    }

    #[test]
    fn test_abort() {
        let rendezvous = Arc::new(Rendezvous::new(2));
        let waiter = {
            let r = rendezvous.clone();
            thread::spawn(move || r.wait())
        };
        rendezvous.abort();
        assert_eq!(waiter.join().unwrap(), Err(TransportError::RemoteError));
        assert_eq!(rendezvous.wait(), Err(TransportError::RemoteError));
    }
}
