// Copyright 2020 Joyent, Inc.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use slog::debug;

use crate::client::Client;
use crate::connection::{Connection, ResponseStream};
use crate::context::RequestContext;
use crate::error::Error;

/// One notification from a streamed RPC.
#[derive(Debug)]
pub enum RpcEvent {
    /// A response message.
    Data(Value),
    /// The RPC finished successfully. No further events follow.
    End,
    /// The RPC failed. No further events follow.
    Error(Error),
}

impl RpcEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            RpcEvent::Data(_) => false,
            RpcEvent::End | RpcEvent::Error(_) => true,
        }
    }
}

/// The response messages of an RPC issued with
/// [`Client::rpc_stream`](../client/struct.Client.html#method.rpc_stream).
///
/// The stream yields any number of `Data` events followed by exactly one
/// `End` or `Error`, after which it is exhausted. The request context is
/// released before the terminal event is handed out. Dropping the stream
/// early also releases the context.
pub struct RpcStream<C: Connection> {
    client: Client<C>,
    method: String,
    ctx: Option<RequestContext<C>>,
    responses: Option<ResponseStream>,
    failure: Option<Error>,
    done: bool,
}

impl<C> RpcStream<C>
where
    C: Connection,
{
    pub(crate) fn new(
        client: Client<C>,
        method: &str,
        ctx: RequestContext<C>,
        responses: ResponseStream,
    ) -> Self {
        RpcStream {
            client,
            method: method.to_string(),
            ctx: Some(ctx),
            responses: Some(responses),
            failure: None,
            done: false,
        }
    }

    // A stream for a request that could not be allocated a connection.
    pub(crate) fn failed(client: Client<C>, method: &str, err: Error) -> Self {
        RpcStream {
            client,
            method: method.to_string(),
            ctx: None,
            responses: None,
            failure: Some(err),
            done: false,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The context the request is running under, until the request ends.
    pub fn context(&self) -> Option<&RequestContext<C>> {
        self.ctx.as_ref()
    }

    fn finish(&mut self, error: Option<&Error>) {
        self.done = true;
        self.responses = None;
        if let Some(mut ctx) = self.ctx.take() {
            self.client.observe(&self.method, &ctx, error);
            self.client.ctx_release(&mut ctx);
        }
    }
}

impl<C> Stream for RpcStream<C>
where
    C: Connection,
{
    type Item = RpcEvent;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<RpcEvent>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(err) = this.failure.take() {
            this.done = true;
            return Poll::Ready(Some(RpcEvent::Error(err)));
        }

        let responses = match this.responses.as_mut() {
            Some(responses) => responses,
            None => {
                this.done = true;
                return Poll::Ready(None);
            }
        };

        match responses.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(message))) => {
                Poll::Ready(Some(RpcEvent::Data(message)))
            }
            Poll::Ready(Some(Err(err))) => {
                let err = this.client.transport_error(err);
                this.finish(Some(&err));
                Poll::Ready(Some(RpcEvent::Error(err)))
            }
            Poll::Ready(None) => {
                this.finish(None);
                Poll::Ready(Some(RpcEvent::End))
            }
        }
    }
}

impl<C> Drop for RpcStream<C>
where
    C: Connection,
{
    fn drop(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            debug!(ctx.log(), "response stream dropped before completion");
            self.responses = None;
            self.client.ctx_release(&mut ctx);
        }
    }
}
