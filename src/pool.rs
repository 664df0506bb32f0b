//! Named, bounded connection pools shared across the steps of a scenario.
//!
//! Connections are opened externally through user callbacks, once per
//! session, and read-shared by virtual users: copy number `c` uses slot
//! `c mod count`. The engine never mutates a connection; thread-safety of
//! the connection object is the user's concern.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::SessionInfo;
use crate::error::{AppError, Result, UserError};

/// Type-erased connection handle stored in a pool slot.
pub type PoolConnection = Arc<dyn Any + Send + Sync>;

type OpenFn = Arc<
    dyn Fn(usize, PoolContext) -> BoxFuture<'static, std::result::Result<PoolConnection, UserError>>
        + Send
        + Sync,
>;
type CloseFn = Arc<
    dyn Fn(PoolConnection, PoolContext) -> BoxFuture<'static, std::result::Result<(), UserError>>
        + Send
        + Sync,
>;

/// Context passed to the user's open/close callbacks.
#[derive(Clone, Debug)]
pub struct PoolContext {
    pub session: SessionInfo,
    pub cancellation: CancellationToken,
}

/// Declarative pool configuration attached to steps at build time. The
/// runtime pool is resolved from it once, at session init.
#[derive(Clone)]
pub struct ConnectionPoolArgs {
    pub name: String,
    pub count: usize,
    open: OpenFn,
    close: CloseFn,
}

impl ConnectionPoolArgs {
    /// Declare a pool of `count` connections of type `C`. `open` is called
    /// with the slot index; `close` receives the connection back at
    /// session end.
    pub fn new<C, O, OF, Cl, CF>(
        name: impl Into<String>,
        count: usize,
        open: O,
        close: Cl,
    ) -> Self
    where
        C: Any + Send + Sync,
        O: Fn(usize, PoolContext) -> OF + Send + Sync + 'static,
        OF: std::future::Future<Output = std::result::Result<C, UserError>> + Send + 'static,
        Cl: Fn(Arc<C>, PoolContext) -> CF + Send + Sync + 'static,
        CF: std::future::Future<Output = std::result::Result<(), UserError>> + Send + 'static,
    {
        let open: OpenFn = Arc::new(
            move |index, ctx| -> BoxFuture<'static, std::result::Result<PoolConnection, UserError>> {
                let fut = open(index, ctx);
                Box::pin(async move { fut.await.map(|conn| Arc::new(conn) as PoolConnection) })
            },
        );
        let close: CloseFn = Arc::new(
            move |conn, ctx| -> BoxFuture<'static, std::result::Result<(), UserError>> {
                match conn.downcast::<C>() {
                    Ok(typed) => Box::pin(close(typed, ctx)),
                    Err(_) => Box::pin(async { Ok(()) }),
                }
            },
        );
        Self {
            name: name.into(),
            count,
            open,
            close,
        }
    }

    /// Whether two args values originate from the same declaration.
    /// Clones share the callback allocation, distinct declarations do not.
    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.open, &other.open)
    }
}

impl fmt::Debug for ConnectionPoolArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPoolArgs")
            .field("name", &self.name)
            .field("count", &self.count)
            .finish()
    }
}

/// Effective pool name, namespaced per scenario so independent scenarios
/// do not collide.
pub(crate) fn resolved_pool_name(scenario_name: &str, pool_name: &str) -> String {
    format!("{scenario_name}.{pool_name}")
}

/// A runtime pool: an ordered set of opened connections.
pub struct ConnectionPool {
    name: String,
    args: ConnectionPoolArgs,
    connections: Vec<PoolConnection>,
}

impl ConnectionPool {
    pub(crate) fn new(resolved_name: String, args: ConnectionPoolArgs) -> Self {
        Self {
            name: resolved_name,
            args,
            connections: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Open all connections in parallel. On any failure the
    /// already-opened connections are closed and the first failure is
    /// returned.
    pub(crate) async fn init(&mut self, ctx: &PoolContext) -> Result<()> {
        let opens = (0..self.args.count).map(|index| (self.args.open)(index, ctx.clone()));
        let results = join_all(opens).await;

        let mut opened = Vec::with_capacity(results.len());
        let mut failure = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(conn) => opened.push(conn),
                Err(cause) if failure.is_none() => {
                    failure = Some(AppError::PoolOpenFailed {
                        pool: self.name.clone(),
                        index,
                        cause: cause.to_string(),
                    });
                }
                Err(_) => {}
            }
        }

        if let Some(err) = failure {
            self.connections = opened;
            self.dispose(ctx).await;
            self.connections.clear();
            return Err(err);
        }

        info!(pool = %self.name, count = opened.len(), "connection pool opened");
        self.connections = opened;
        Ok(())
    }

    /// The connection for a given virtual user: slot `copy_number mod count`.
    /// Infallible after a successful `init`; `None` only for an empty pool.
    pub fn get(&self, copy_number: u64) -> Option<PoolConnection> {
        if self.connections.is_empty() {
            return None;
        }
        let slot = (copy_number % self.connections.len() as u64) as usize;
        Some(self.connections[slot].clone())
    }

    /// Close every connection. Individual failures are logged, never
    /// propagated.
    pub(crate) async fn dispose(&self, ctx: &PoolContext) {
        let closes = self
            .connections
            .iter()
            .map(|conn| (self.args.close)(conn.clone(), ctx.clone()));
        for (index, result) in join_all(closes).await.into_iter().enumerate() {
            if let Err(error) = result {
                warn!(pool = %self.name, index, %error, "failed to close connection");
            }
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("count", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_ctx() -> PoolContext {
        PoolContext {
            session: SessionInfo {
                session_id: "session-test".into(),
                node_name: "localhost".into(),
            },
            cancellation: CancellationToken::new(),
        }
    }

    fn counting_args(count: usize, closed: Arc<AtomicUsize>) -> ConnectionPoolArgs {
        ConnectionPoolArgs::new(
            "db",
            count,
            |index, _ctx| async move { Ok(index as u64) },
            move |_conn: Arc<u64>, _ctx| {
                let closed = closed.clone();
                async move {
                    closed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
    }

    #[tokio::test]
    async fn copies_map_onto_slots_modulo_count() {
        let mut pool = ConnectionPool::new(
            resolved_pool_name("checkout", "db"),
            counting_args(3, Arc::new(AtomicUsize::new(0))),
        );
        pool.init(&test_ctx()).await.unwrap();
        assert_eq!(pool.name(), "checkout.db");

        for copy in 0..9u64 {
            let conn = pool.get(copy).unwrap().downcast::<u64>().unwrap();
            assert_eq!(*conn, copy % 3);
        }
    }

    #[tokio::test]
    async fn open_failure_rolls_back_opened_connections() {
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_in_args = closed.clone();
        let args = ConnectionPoolArgs::new(
            "flaky",
            4,
            |index, _ctx| async move {
                if index == 2 {
                    Err::<u64, UserError>("boom".into())
                } else {
                    Ok(index as u64)
                }
            },
            move |_conn: Arc<u64>, _ctx| {
                let closed = closed_in_args.clone();
                async move {
                    closed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );
        let mut pool = ConnectionPool::new(resolved_pool_name("s", "flaky"), args);

        let err = pool.init(&test_ctx()).await.unwrap_err();
        match err {
            AppError::PoolOpenFailed { pool, index, cause } => {
                assert_eq!(pool, "s.flaky");
                assert_eq!(index, 2);
                assert!(cause.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(closed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.count(), 0);
    }

    #[tokio::test]
    async fn dispose_tolerates_close_failures() {
        let args = ConnectionPoolArgs::new(
            "db",
            2,
            |index, _ctx| async move { Ok(index as u64) },
            |_conn: Arc<u64>, _ctx| async move { Err::<(), UserError>("close failed".into()) },
        );
        let mut pool = ConnectionPool::new(resolved_pool_name("s", "db"), args);
        pool.init(&test_ctx()).await.unwrap();
        pool.dispose(&test_ctx()).await;
    }

    #[test]
    fn clones_are_the_same_instance_fresh_declarations_are_not() {
        let a = counting_args(1, Arc::new(AtomicUsize::new(0)));
        let b = a.clone();
        let c = counting_args(1, Arc::new(AtomicUsize::new(0)));
        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
    }
}
