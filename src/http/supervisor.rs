//! Supervised listener tasks.
//!
//! Listeners run for the lifetime of the process, so any of them finishing is
//! a failure. [`TaskGroup::wait`] returns the first failure and aborts the
//! remaining tasks; what to do with it is the caller's decision.

use std::future::Future;

use futures::future::select_all;
use tokio::task::JoinHandle;

use super::ServerError;

/// A set of named listener tasks.
#[derive(Default)]
pub struct TaskGroup {
    names: Vec<&'static str>,
    handles: Vec<JoinHandle<Result<(), ServerError>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` onto the runtime under `name`.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), ServerError>> + Send + 'static,
    {
        tracing::debug!(listener = name, "Spawning listener task");
        self.names.push(name);
        self.handles.push(tokio::spawn(task));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for the first task to finish, abort the others, and return why it
    /// finished.
    pub async fn wait(self) -> ServerError {
        if self.handles.is_empty() {
            return ServerError::NoListeners;
        }

        let (finished, index, rest) = select_all(self.handles).await;
        for handle in &rest {
            handle.abort();
        }

        let listener = self.names[index];
        let err = match finished {
            Ok(Ok(())) => ServerError::Exited(listener),
            Ok(Err(err)) => err,
            Err(join_err) => ServerError::Task {
                listener,
                reason: join_err.to_string(),
            },
        };
        tracing::error!(
            listener,
            error = %err,
            stopped = rest.len(),
            "Listener stopped, shutting down remaining listeners"
        );
        err
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    fn failure(listener: &'static str) -> ServerError {
        ServerError::Listener {
            listener,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        }
    }

    /// A task that runs forever, holding `guard` until aborted.
    async fn forever(guard: oneshot::Sender<()>) -> Result<(), ServerError> {
        let _guard = guard;
        std::future::pending::<()>().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_group() {
        let group = TaskGroup::new();
        assert!(group.is_empty());
        assert!(matches!(group.wait().await, ServerError::NoListeners));
    }

    #[tokio::test]
    async fn test_first_failure_is_returned_and_siblings_aborted() {
        let (guard, aborted) = oneshot::channel();
        let mut group = TaskGroup::new();
        group.spawn("primary", forever(guard));
        group.spawn("companion", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<(), _>(failure("companion"))
        });
        assert_eq!(group.len(), 2);

        let err = group.wait().await;
        assert!(matches!(err, ServerError::Listener { listener: "companion", .. }));

        // The sender is dropped once the sibling is aborted
        let dropped = tokio::time::timeout(Duration::from_secs(5), aborted).await;
        assert!(matches!(dropped, Ok(Err(_))));
    }

    #[tokio::test]
    async fn test_clean_exit_is_a_failure() {
        let (guard, _aborted) = oneshot::channel();
        let mut group = TaskGroup::new();
        group.spawn("primary", async { Ok::<(), ServerError>(()) });
        group.spawn("companion", forever(guard));
        assert!(matches!(group.wait().await, ServerError::Exited("primary")));
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported_by_name() {
        let mut group = TaskGroup::new();
        group.spawn("companion", async {
            if true {
                panic!("boom");
            }
            Ok::<(), ServerError>(())
        });
        assert!(matches!(
            group.wait().await,
            ServerError::Task { listener: "companion", .. }
        ));
    }
}
