//! Shared, memoized futures.
use futures_util::future::join_all;
use std::{future::Future, pin::Pin, sync::Arc};
use tokio::sync::{Mutex, OnceCell};

/// A future that runs at most once, however many clones await it.
///
/// The first clone to call [`Thunk::force`] drives the future; concurrent
/// callers wait on the same cell and then borrow the stored result.
pub struct Thunk<T> {
    thunk_state: Arc<ThunkState<T>>,
}
impl<T> Thunk<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + 'static + Send,
    {
        Thunk {
            thunk_state: Arc::new(ThunkState::new(future)),
        }
    }

    /// Await the result, running the future if nobody has yet.
    pub async fn force(&self) -> &T {
        self.thunk_state.force().await
    }

    /// Whether a result is available without waiting.
    pub fn is_forced(&self) -> bool {
        self.thunk_state.cell.initialized()
    }

    /// Force a batch of keyed thunks concurrently, keeping their order.
    pub async fn force_all<'a, Key>(thunks: &'a [(Key, Thunk<T>)]) -> Vec<(&'a Key, &'a T)> {
        let values = join_all(thunks.iter().map(|(_, thunk)| thunk.force())).await;
        thunks.iter().map(|(key, _)| key).zip(values).collect()
    }
}
impl<T> Clone for Thunk<T> {
    fn clone(&self) -> Self {
        Thunk {
            thunk_state: self.thunk_state.clone(),
        }
    }
}

struct ThunkState<T> {
    cell: OnceCell<T>,
    /// Taken by whichever caller initializes `cell`.
    future: Mutex<Option<Pin<Box<dyn Future<Output = T> + Send + 'static>>>>,
}
impl<T> ThunkState<T> {
    fn new<F>(future: F) -> ThunkState<T>
    where
        F: Future<Output = T> + 'static + Send,
    {
        ThunkState {
            cell: OnceCell::new(),
            future: Mutex::new(Some(Box::pin(future))),
        }
    }
    async fn force(self: &Arc<Self>) -> &T {
        self.cell
            .get_or_init(|| async {
                let pending = self.future.lock().await.take();
                match pending {
                    Some(future) => future.await,
                    // Only reachable if the caller that took it was dropped mid-run.
                    None => panic!("thunk future was abandoned"),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_once_across_clones() {
        let runs = Arc::new(AtomicUsize::new(0));
        let t = {
            let runs = runs.clone();
            Thunk::new(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                42
            })
        };
        let t2 = t.clone();
        assert!(!t.is_forced());
        let (v1, v2) = tokio::join!(t.force(), t2.force());
        assert_eq!((*v1, *v2), (42, 42));
        assert_eq!(*t.force().await, 42);
        assert!(t2.is_forced());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_all_keeps_keys() {
        let thunks = vec![
            ("a", Thunk::new(async { 1 })),
            ("b", Thunk::new(async { 2 })),
        ];
        let forced = Thunk::force_all(&thunks).await;
        assert_eq!(forced, vec![(&"a", &1), (&"b", &2)]);
    }
}
