//! Streaming answers.

use log::debug;
use model_host_types::ResponseMessage;

use super::controller::Controller;
use super::dispatcher::Route;
use crate::error::RequestError;

/// Answer to `complete`/`chat`: whole text, or a stream when `stream` was set.
pub enum Generation<'a> {
    Text(String),
    Stream(TokenStream<'a>),
}

impl Generation<'_> {
    /// The full text, draining the stream if there is one.
    pub fn text(self) -> Result<String, RequestError> {
        match self {
            Generation::Text(text) => Ok(text),
            Generation::Stream(stream) => stream.collect(),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Generation::Stream(_))
    }
}

/// Tokens of one streaming request, after its `stream_start`.
///
/// Ends on `stream_end`; an `error` from the worker (or a timeout, or the
/// worker dying) is yielded once as `Err` and ends the stream. Holding the
/// stream borrows the controller, so no other request can interleave.
/// Dropping it early abandons the request; its remaining tokens are
/// discarded.
pub struct TokenStream<'a> {
    controller: &'a mut Controller,
    route: Option<Route>,
}

impl<'a> TokenStream<'a> {
    pub(crate) fn new(controller: &'a mut Controller, route: Route) -> Self {
        Self {
            controller,
            route: Some(route),
        }
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Result<String, RequestError>;

    fn next(&mut self) -> Option<Self::Item> {
        let route = self.route.as_ref()?;
        let timeout = self.controller.config().timeouts.token;
        let item = match self.controller.wait_response(route, timeout, "stream token") {
            Ok(ResponseMessage::StreamToken { token }) => {
                self.controller.add_streamed_token();
                return Some(Ok(token));
            }
            Ok(ResponseMessage::StreamEnd) => None,
            Ok(other) => Some(Err(RequestError::UnexpectedResponse {
                request: "stream",
                got: other.kind(),
            })),
            Err(e) => Some(Err(e)),
        };
        if let Some(route) = self.route.take() {
            debug!("[CONTROLLER] Stream {} finished", route.id());
        }
        item
    }
}
