//! Long-running cluster actions.
//!
//! An [`Operation`] is a cheap handle to a task running on the tokio
//! runtime. Its progress lives in a `watch` channel, so any number of
//! callers can wait on it and all of them observe the same terminal state
//! and the same error. `Running` moves to `Success` or `Failure` exactly
//! once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flock_common::error::ErrorCode;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::ClusterError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Bootstrap,
    Join,
    Leave,
    Rename,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Success,
    Failure,
}

/// `GET /1.0/operations/<id>` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationView {
    pub id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub err: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub may_cancel: bool,
}

#[derive(Debug, Clone)]
struct Progress {
    status: OperationStatus,
    error: Option<(ErrorCode, String)>,
    updated_at: DateTime<Utc>,
}

struct OperationInner {
    id: String,
    kind: OperationKind,
    created_at: DateTime<Utc>,
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
    may_cancel: Mutex<bool>,
}

/// Handle to a running or finished operation.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl Operation {
    fn new(kind: OperationKind, cancellable: bool) -> Self {
        let now = Utc::now();
        let (progress, _) = watch::channel(Progress {
            status: OperationStatus::Running,
            error: None,
            updated_at: now,
        });
        Self {
            inner: Arc::new(OperationInner {
                id: flock_common::id::generate_operation_id(),
                kind,
                created_at: now,
                progress,
                cancel: CancellationToken::new(),
                may_cancel: Mutex::new(cancellable),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    pub fn status(&self) -> OperationStatus {
        self.inner.progress.borrow().status
    }

    pub fn view(&self) -> OperationView {
        let progress = self.inner.progress.borrow().clone();
        let (error_code, err) = match progress.error {
            Some((code, message)) => (Some(code), message),
            None => (None, String::new()),
        };
        OperationView {
            id: self.inner.id.clone(),
            kind: self.inner.kind,
            status: progress.status,
            error_code,
            err,
            created_at: self.inner.created_at,
            updated_at: progress.updated_at,
            may_cancel: progress.status == OperationStatus::Running && *self.may_cancel_guard(),
        }
    }

    /// Block until the operation leaves `Running`; replay its error if it failed.
    pub async fn wait(&self) -> Result<(), ClusterError> {
        let mut rx = self.inner.progress.subscribe();
        let progress = {
            let guard = rx
                .wait_for(|p| p.status != OperationStatus::Running)
                .await
                .map_err(|_| ClusterError::Internal("operation state dropped".to_string()))?;
            (*guard).clone()
        };
        match progress.error {
            Some((code, message)) => Err(ClusterError::OperationFailed { code, message }),
            None => Ok(()),
        }
    }

    /// [`wait`](Self::wait) bounded by `timeout`; `None` if still running.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ClusterError>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Request cancellation. Fails once the operation has passed the point
    /// where it can be abandoned without leaving partial state behind.
    pub fn cancel(&self) -> Result<(), ClusterError> {
        let mut may_cancel = self.may_cancel_guard();
        if !*may_cancel || self.status() != OperationStatus::Running {
            return Err(ClusterError::NotCancellable);
        }
        *may_cancel = false;
        self.inner.cancel.cancel();
        Ok(())
    }

    /// Called by an operation body right before it commits or starts a
    /// remote round trip. After this, `cancel` is refused.
    pub(crate) fn enter_uncancellable(&self) -> Result<(), ClusterError> {
        let mut may_cancel = self.may_cancel_guard();
        if self.inner.cancel.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }
        *may_cancel = false;
        Ok(())
    }

    fn finish(&self, result: &Result<(), ClusterError>) -> bool {
        let now = Utc::now();
        self.inner.progress.send_if_modified(|p| {
            if p.status != OperationStatus::Running {
                return false;
            }
            match result {
                Ok(()) => p.status = OperationStatus::Success,
                Err(e) => {
                    p.status = OperationStatus::Failure;
                    p.error = Some((e.code(), e.to_string()));
                }
            }
            p.updated_at = now;
            true
        })
    }

    fn finished_before(&self, cutoff: DateTime<Utc>) -> bool {
        let progress = self.inner.progress.borrow();
        progress.status != OperationStatus::Running && progress.updated_at < cutoff
    }

    fn may_cancel_guard(&self) -> std::sync::MutexGuard<'_, bool> {
        self.inner
            .may_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawns operation bodies and keeps their handles for lookup.
pub struct OperationRunner {
    operations: Mutex<HashMap<String, Operation>>,
    retention: Duration,
}

impl OperationRunner {
    /// Finished operations are forgotten `retention` after they end.
    pub fn new(retention: Duration) -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Run `body` on its own task and return its handle immediately.
    ///
    /// A cancellable operation is abandoned at its next await point when
    /// cancelled, unless the body already called `enter_uncancellable`.
    pub fn spawn<F, Fut>(&self, kind: OperationKind, cancellable: bool, body: F) -> Operation
    where
        F: FnOnce(Operation) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ClusterError>> + Send + 'static,
    {
        self.prune();

        let op = Operation::new(kind, cancellable);
        self.lock().insert(op.id().to_string(), op.clone());

        let task_op = op.clone();
        let token = op.inner.cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                result = body(task_op.clone()) => result,
                _ = token.cancelled() => Err(ClusterError::Cancelled),
            };
            match &result {
                Ok(()) => tracing::debug!(
                    operation = %task_op.id(),
                    kind = ?task_op.kind(),
                    "Operation succeeded"
                ),
                Err(e) => tracing::warn!(
                    operation = %task_op.id(),
                    kind = ?task_op.kind(),
                    error = %e,
                    "Operation failed"
                ),
            }
            task_op.finish(&result);
        });

        op
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.prune();
        self.lock().get(id).cloned()
    }

    /// All retained operations, oldest first.
    pub fn list(&self) -> Vec<Operation> {
        self.prune();
        let mut ops: Vec<Operation> = self.lock().values().cloned().collect();
        ops.sort_by_key(|op| op.inner.created_at);
        ops
    }

    fn prune(&self) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;
        self.lock().retain(|_, op| !op.finished_before(cutoff));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Operation>> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
