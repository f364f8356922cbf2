// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use derive_more::{Display, From, Into};
use slog::Logger;

use crate::backend::BackendKey;
use crate::connection_pool::types::AllocationHandle;

/// Identifies a request context within one client. Ids are never reused.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd,
)]
pub struct ContextId(u64);

/// Binds one allocated connection to one logical request.
///
/// Contexts are created by the [`Client`](../client/struct.Client.html) and
/// must be handed back to it exactly once through `Client::ctx_release`,
/// which releases the underlying connection to the pool.
pub struct RequestContext<C> {
    pub(crate) id: ContextId,
    pub(crate) handle: AllocationHandle<C>,
    pub(crate) started: Instant,
    pub(crate) log: Logger,
}

impl<C> RequestContext<C> {
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The connection the request must be issued on.
    pub fn connection(&self) -> &Rc<C> {
        self.handle.connection()
    }

    pub fn backend_key(&self) -> &BackendKey {
        self.handle.key()
    }

    /// A logger tagged with this request's id.
    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }
}

impl<C> fmt::Debug for RequestContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}
