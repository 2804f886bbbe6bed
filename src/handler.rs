//! Handler contract between the session and user code.

use async_trait::async_trait;

use crate::request::Request;
use crate::rpc::Rpc;

/// User-side entry points of a session.
///
/// `handle_connect` runs once per session, on its own task, right after
/// setup. `handle_call` runs once per incoming request, each on a fresh
/// task whose cancellation rides the request's
/// [`abort_token`](Request::abort_token); the handler owns the request's
/// stream and is responsible for eventually closing it (or responding).
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Called once after the session is set up.
    async fn handle_connect(&self, rpc: &Rpc) {
        let _ = rpc;
    }

    /// Called once per incoming request.
    async fn handle_call(&self, req: Request, rpc: &Rpc);
}
