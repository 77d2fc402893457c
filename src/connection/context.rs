//! Per-connection attached context.
//!
//! The layer above the connection (a broker session, for instance) attaches
//! one value to each connection. The value may carry a cleanup action which
//! runs exactly once, when the value is replaced or the connection is
//! destroyed, immediately before the value itself is dropped.

use std::any::Any;
use std::fmt;

type Cleanup = Box<dyn FnOnce(&mut (dyn Any + Send)) + Send>;

/// An owned value plus its optional cleanup action.
pub struct Context {
    value: Box<dyn Any + Send>,
    cleanup: Option<Cleanup>,
}

impl Context {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
            cleanup: None,
        }
    }

    /// Attaches `cleanup`, which receives the value right before it is dropped.
    pub fn with_cleanup<T, F>(value: T, cleanup: F) -> Self
    where
        T: Any + Send,
        F: FnOnce(&mut T) + Send + 'static,
    {
        Self {
            value: Box::new(value),
            cleanup: Some(Box::new(move |value: &mut (dyn Any + Send)| {
                if let Some(value) = value.downcast_mut::<T>() {
                    cleanup(value);
                }
            })),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.downcast_mut::<T>()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup(self.value.as_mut());
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("has_cleanup", &self.cleanup.is_some())
            .finish_non_exhaustive()
    }
}
