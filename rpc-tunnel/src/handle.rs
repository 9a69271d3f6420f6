//! CallHandle: caller-side view of a call's eventual outcome.
//!
//! A transport returns a `CallHandle` as soon as a call is queued. The handle
//! can be waited on from a plain thread ([`CallHandle::get`],
//! [`CallHandle::get_timeout`]) or awaited from async code, since it also
//! implements [`Future`].
//!
//! # Resolution rules
//!
//! ```text
//! no payload                     -> Err(EmptyResult)
//! structured, error != null      -> Err(Remote(error))   (verbatim)
//! structured, result             -> convert(Reply::Value(result))
//! binary                         -> convert(Reply::Binary(bytes))
//! transport / connection failure -> Err(Transport | ConnectionLost)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::correlation::{ReplySlot, Resolution};
use crate::envelope::Reply;
use crate::error::CallError;

/// Conversion applied to a successful reply.
type Converter<T> = Arc<dyn Fn(Reply) -> Result<T, CallError> + Send + Sync>;

/// Handle to the eventual outcome of one call.
///
/// Parameterized by a conversion function rather than subclassed per call
/// site: the default `CallHandle<Reply>` hands out the raw reply, and
/// [`map`](CallHandle::map) or [`typed`](CallHandle::typed) derive handles
/// producing other types from the same slot.
pub struct CallHandle<T = Reply> {
    slot: Arc<ReplySlot>,
    convert: Converter<T>,
}

impl CallHandle<Reply> {
    /// Create a handle over `slot` yielding the raw reply.
    pub fn new(slot: Arc<ReplySlot>) -> Self {
        Self {
            slot,
            convert: Arc::new(|reply: Reply| Ok::<Reply, CallError>(reply)),
        }
    }

    /// Create a handle that is already resolved.
    pub fn ready(resolution: Resolution) -> Self {
        Self::new(ReplySlot::resolved(resolution))
    }

    /// Derive a handle decoding the structured result into `U`.
    pub fn typed<U: DeserializeOwned + 'static>(self) -> CallHandle<U> {
        self.map(|reply| Ok(serde_json::from_value(reply.into_value()?)?))
    }
}

impl<T> CallHandle<T> {
    /// Replace the conversion applied to the reply.
    pub fn map<U, F>(self, f: F) -> CallHandle<U>
    where
        F: Fn(T) -> Result<U, CallError> + Send + Sync + 'static,
        T: 'static,
        U: 'static,
    {
        let inner = self.convert;
        CallHandle {
            slot: self.slot,
            convert: Arc::new(move |reply: Reply| f(inner(reply)?)),
        }
    }

    /// Block the calling thread until the call resolves.
    ///
    /// Must not be called from inside an async task; await the handle there.
    pub fn get(&self) -> Result<T, CallError> {
        self.finish(self.slot.wait())
    }

    /// Block until the call resolves or `timeout` elapses.
    ///
    /// On expiry returns [`CallError::Timeout`]; the call stays pending and a
    /// later `get` can still observe its reply.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, CallError> {
        self.finish(self.slot.wait_timeout(timeout))
    }

    /// Stop waiting for the reply.
    ///
    /// Releases every waiter with [`CallError::Cancelled`]. The server-side
    /// call is not retracted. Returns `false` if the call already finished.
    pub fn cancel(&self) -> bool {
        self.slot.cancel()
    }

    /// Whether the call finished, failed or was cancelled.
    pub fn is_done(&self) -> bool {
        self.slot.is_settled()
    }

    /// Whether [`cancel`](Self::cancel) took effect.
    pub fn is_cancelled(&self) -> bool {
        self.slot.is_cancelled()
    }

    fn finish(&self, resolution: Resolution) -> Result<T, CallError> {
        let payload = resolution?.ok_or(CallError::EmptyResult)?;
        (self.convert)(payload.into_reply()?)
    }
}

impl<T> Future for CallHandle<T> {
    type Output = Result<T, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.slot.poll_settled(cx) {
            Poll::Ready(resolution) => Poll::Ready(self.finish(resolution)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for CallHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle").field("slot", &self.slot).finish()
    }
}
