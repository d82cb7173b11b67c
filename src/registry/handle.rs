use crate::model::InstanceModel;
use std::sync::Arc;
use tokio::sync::watch;

/// Live view of an instance this process started.
///
/// Clones share the same termination state. Once terminated a handle never
/// comes back; a later `start` for the same directory yields a new handle.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    model: InstanceModel,
    terminated: watch::Sender<bool>,
}

impl InstanceHandle {
    pub(crate) fn new(model: InstanceModel) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            inner: Arc::new(HandleInner { model, terminated }),
        }
    }

    pub fn model(&self) -> &InstanceModel {
        &self.inner.model
    }

    pub fn name(&self) -> &str {
        &self.inner.model.name
    }

    pub fn is_terminated(&self) -> bool {
        *self.inner.terminated.borrow()
    }

    /// Resolves once the registry has disposed this handle.
    pub async fn terminated(&self) {
        let mut rx = self.inner.terminated.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Marks the handle terminated. Returns `false` if it already was.
    pub(crate) fn dispose(&self) -> bool {
        !self.inner.terminated.send_replace(true)
    }

    pub(crate) fn same_as(&self, other: &InstanceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
