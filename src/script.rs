//! Embedded script host surface (§6, §9 "Lua script host"). The core only
//! defines the callbacks it invokes and the data it hands over; it treats
//! the host as a pure transformer and mediates every side effect through
//! return codes and the injection queue. [`NoopScriptHost`] lets the session
//! state machine and its tests run with no embedding at all.
//!
//! Trait methods return a named `impl Future` rather than going through the
//! `async_trait` macro, matching the vtable-free dispatch style used
//! elsewhere for the protocol's other plugin-shaped traits.

use std::future::Future;

use crate::backend::Role;
use crate::injection::InjectionQueue;
use crate::protocol::mysql::ColumnDefinition;

/// Identity handed to the script host in place of a full session reference,
/// so the host never gets a way to reach into internals beyond what these
/// callbacks hand it explicitly.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: u64,
    pub identity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject,
    Fallthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryDecision {
    Forward,
    Inject,
    ShortCircuit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDecision {
    Forward,
    Swallow,
}

/// A view over a completed result set, handed to `on_read_query_result`.
/// Rows are not replayed here: the callback decides forward-vs-swallow
/// before the state machine streams rows to the client.
#[derive(Debug, Clone, Default)]
pub struct ResultSetView {
    pub fields: Option<Vec<ColumnDefinition>>,
}

pub trait ScriptHost: Send + Sync {
    fn on_connect(&self, session: &SessionContext) -> impl Future<Output = ConnectDecision> + Send;

    fn on_auth(
        &self,
        session: &SessionContext,
        identity: &str,
    ) -> impl Future<Output = AuthDecision> + Send;

    /// May enqueue injections and/or narrow `routing` away from its
    /// read-write default, per §4.7 step (1).
    fn on_read_query(
        &self,
        session: &SessionContext,
        query: &[u8],
        injections: &mut InjectionQueue,
        routing: &mut Role,
    ) -> impl Future<Output = QueryDecision> + Send;

    fn on_read_query_result(
        &self,
        session: &SessionContext,
        resultset: &ResultSetView,
    ) -> impl Future<Output = ResultDecision> + Send;

    fn on_disconnect(&self, session: &SessionContext) -> impl Future<Output = ()> + Send;
}

/// The default host: accepts everything, never injects, never swallows a
/// result. Used when no embedding is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScriptHost;

impl ScriptHost for NoopScriptHost {
    async fn on_connect(&self, _session: &SessionContext) -> ConnectDecision {
        ConnectDecision::Accept
    }

    async fn on_auth(&self, _session: &SessionContext, _identity: &str) -> AuthDecision {
        AuthDecision::Accept
    }

    async fn on_read_query(
        &self,
        _session: &SessionContext,
        _query: &[u8],
        _injections: &mut InjectionQueue,
        _routing: &mut Role,
    ) -> QueryDecision {
        QueryDecision::Forward
    }

    async fn on_read_query_result(
        &self,
        _session: &SessionContext,
        _resultset: &ResultSetView,
    ) -> ResultDecision {
        ResultDecision::Forward
    }

    async fn on_disconnect(&self, _session: &SessionContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_host_accepts_and_forwards_everything() {
        let host = NoopScriptHost;
        let ctx = SessionContext {
            session_id: 1,
            identity: None,
        };

        assert_eq!(host.on_connect(&ctx).await, ConnectDecision::Accept);
        assert_eq!(host.on_auth(&ctx, "alice").await, AuthDecision::Accept);

        let mut injections = InjectionQueue::new();
        let mut routing = Role::ReadWrite;
        assert_eq!(
            host.on_read_query(&ctx, b"SELECT 1", &mut injections, &mut routing)
                .await,
            QueryDecision::Forward
        );
        assert!(injections.is_empty());
        assert_eq!(routing, Role::ReadWrite);

        assert_eq!(
            host.on_read_query_result(&ctx, &ResultSetView::default()).await,
            ResultDecision::Forward
        );

        host.on_disconnect(&ctx).await;
    }
}
