use crate::error::Result;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Mutex};

type SharedOp<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Pending<T> {
    generation: u64,
    op: SharedOp<T>,
}

struct SlotState<T> {
    next_generation: u64,
    pending: Option<Pending<T>>,
}

/// Single-assignment slot for one in-flight operation
///
/// A caller either joins the operation already in the slot or becomes the one
/// that starts it. The slot is cleared exactly once, when the operation
/// settles, before any caller observes the outcome.
pub(crate) struct PendingSlot<T> {
    state: Arc<Mutex<SlotState<T>>>,
}

impl<T> PendingSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState {
                next_generation: 0,
                pending: None,
            })),
        }
    }

    /// Join the pending operation, or start one with `start`
    pub async fn run<F, Fut>(&self, start: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let op = {
            let mut state = self.state.lock().unwrap();
            match &state.pending {
                Some(pending) => pending.op.clone(),
                None => {
                    let generation = state.next_generation;
                    state.next_generation += 1;

                    let slot = self.state.clone();
                    let work = start();
                    let op = async move {
                        let outcome = work.await;
                        let mut state = slot.lock().unwrap();
                        if state
                            .pending
                            .as_ref()
                            .is_some_and(|p| p.generation == generation)
                        {
                            state.pending = None;
                        }
                        outcome
                    }
                    .boxed()
                    .shared();

                    state.pending = Some(Pending {
                        generation,
                        op: op.clone(),
                    });
                    op
                }
            }
        };

        op.await
    }

    /// Whether an operation is currently in flight
    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlexError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_operation() {
        let slot = Arc::new(PendingSlot::<u32>::new());
        let starts = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let slot = slot.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                slot.run(|| {
                    starts.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    }
                })
                .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(!slot.is_pending());
    }

    #[tokio::test]
    async fn failure_is_shared_and_slot_clears() {
        let slot = PendingSlot::<u32>::new();
        let first = slot.run(|| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(PlexError::ServerUnavailable("none".into()))
        });
        let second = slot.run(|| async { Ok(1) });
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(first, Err(PlexError::ServerUnavailable(_))));
        assert!(matches!(second, Err(PlexError::ServerUnavailable(_))));
        assert!(!slot.is_pending());

        // settled, so the next caller starts a fresh operation
        assert_eq!(slot.run(|| async { Ok(2) }).await.unwrap(), 2);
    }
}
