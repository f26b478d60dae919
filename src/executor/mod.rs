use std::{ops::Deref, pin::Pin, sync::Arc, task::Poll, time::Duration};

use futures::Future;

/// indicates which executor is used
pub enum ExecutorKind {
    /// Tokio executor
    Tokio,
    /// async-std executor
    AsyncStd,
}

/// Wrapper trait abstracting the Tokio and async-std executors
pub trait Executor: Clone + Send + Sync + 'static {
    /// spawns a new task
    #[allow(clippy::result_unit_err)]
    fn spawn(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) -> Result<(), ()>;

    /// waits for a configurable time
    fn delay(&self, duration: Duration) -> Delay;

    /// returns which executor is currently used, the connection picks its TCP stream
    /// implementation from it
    fn kind(&self) -> ExecutorKind;
}

/// Wrapper for the Tokio executor
#[cfg(feature = "tokio-runtime")]
#[derive(Clone, Debug)]
pub struct TokioExecutor;

#[cfg(feature = "tokio-runtime")]
impl Executor for TokioExecutor {
    fn spawn(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) -> Result<(), ()> {
        tokio::task::spawn(f);
        Ok(())
    }

    fn delay(&self, duration: Duration) -> Delay {
        Delay::Tokio(Box::pin(tokio::time::sleep(duration)))
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Tokio
    }
}

/// Wrapper for the async-std executor
#[cfg(feature = "async-std-runtime")]
#[derive(Clone, Debug)]
pub struct AsyncStdExecutor;

#[cfg(feature = "async-std-runtime")]
impl Executor for AsyncStdExecutor {
    fn spawn(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) -> Result<(), ()> {
        async_std::task::spawn(f);
        Ok(())
    }

    fn delay(&self, duration: Duration) -> Delay {
        Delay::AsyncStd(Box::pin(async_std::task::sleep(duration)))
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::AsyncStd
    }
}

impl<Exe: Executor> Executor for Arc<Exe> {
    fn spawn(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) -> Result<(), ()> {
        self.deref().spawn(f)
    }

    fn delay(&self, duration: Duration) -> Delay {
        self.deref().delay(duration)
    }

    fn kind(&self) -> ExecutorKind {
        self.deref().kind()
    }
}

/// a future producing a `()` after some time
pub enum Delay {
    /// wrapper around tokio's `Sleep`
    #[cfg(feature = "tokio-runtime")]
    Tokio(Pin<Box<tokio::time::Sleep>>),
    /// wrapper around async-std's `sleep`
    #[cfg(feature = "async-std-runtime")]
    AsyncStd(Pin<Box<dyn Future<Output = ()> + Send>>),
    #[cfg(all(not(feature = "tokio-runtime"), not(feature = "async-std-runtime")))]
    PlaceHolder,
}

impl Future for Delay {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context) -> Poll<Self::Output> {
        match self.get_mut() {
            #[cfg(feature = "tokio-runtime")]
            Delay::Tokio(d) => d.as_mut().poll(cx),
            #[cfg(feature = "async-std-runtime")]
            Delay::AsyncStd(d) => d.as_mut().poll(cx),
            #[cfg(all(not(feature = "tokio-runtime"), not(feature = "async-std-runtime")))]
            Delay::PlaceHolder => {
                unimplemented!(
                    "please activate one of the following cargo features: tokio-runtime, \
                     async-std-runtime"
                )
            }
        }
    }
}
