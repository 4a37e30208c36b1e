//! Server group: several acceptors under one lifecycle.
//!
//! All acceptors share a cancellation scope derived from the caller's token.
//! The first acceptor to fail cancels the scope, the rest stop accepting, and
//! the group returns that first error once every task has exited.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, Instrument};

use super::buffer_pool::BufferPool;
use super::listener::{Acceptor, ListenerConfig, ListenerStats};
use crate::error::ProxyError;

/// A set of bound acceptors, ready to run.
pub struct ServerGroup {
    acceptors: Vec<Acceptor>,
}

impl ServerGroup {
    /// Bind every listener. All listeners share one buffer pool.
    ///
    /// If any bind fails, the listeners bound so far are closed and the
    /// bind error is returned.
    pub async fn bind(
        configs: impl IntoIterator<Item = ListenerConfig>,
        pool: Arc<BufferPool>,
    ) -> Result<Self, ProxyError> {
        let mut acceptors = Vec::new();
        for config in configs {
            acceptors.push(Acceptor::bind(config, Arc::clone(&pool)).await?);
        }
        Ok(Self { acceptors })
    }

    /// Addresses the acceptors are bound to, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.acceptors.iter().map(Acceptor::local_addr).collect()
    }

    /// Statistics per acceptor, in configuration order.
    pub fn stats(&self) -> Vec<Arc<ListenerStats>> {
        self.acceptors.iter().map(Acceptor::stats).collect()
    }

    /// Run every acceptor until `shutdown` fires or one of them fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let scope = shutdown.child_token();
        let tasks = self.acceptors.into_iter().map(|acceptor| {
            let span = tracing::info_span!("listener", bind_addr = %acceptor.local_addr());
            acceptor.run(scope.clone()).instrument(span)
        });

        join_scoped(tasks, scope.clone()).await
    }
}

/// Run `tasks` to completion. The first failure cancels `scope`, which the
/// tasks are expected to watch, and is returned once every task has exited.
pub(crate) async fn join_scoped<I, F>(tasks: I, scope: CancellationToken) -> Result<(), ProxyError>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<(), ProxyError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for task in tasks {
        set.spawn(task);
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        let result = joined.map_err(ProxyError::from).and_then(|r| r);
        if let Err(e) = result {
            error!(error = %e, "Listener failed");
            scope.cancel();
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Bind and run every listener in `configs` under `shutdown`.
pub async fn run_server_group(
    configs: impl IntoIterator<Item = ListenerConfig>,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    ServerGroup::bind(configs, Arc::new(BufferPool::new()))
        .await?
        .run(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::time::Duration;

    use async_trait::async_trait;
    use edgegate_networking::PrefixIndex;
    use tokio::net::{TcpListener, TcpStream};

    use crate::proxy::Resolver;

    struct Unreachable;

    #[async_trait]
    impl Resolver for Unreachable {
        async fn resolve(&self, _source: &TcpStream) -> io::Result<TcpStream> {
            Err(io::Error::other("unreachable"))
        }
    }

    fn config(port: u16) -> ListenerConfig {
        ListenerConfig::new(
            "127.0.0.1",
            port,
            Arc::new(PrefixIndex::new()),
            Arc::new(Unreachable),
        )
    }

    #[tokio::test]
    async fn test_group_binds_all_listeners() {
        let group = ServerGroup::bind([config(0), config(0)], Arc::new(BufferPool::new()))
            .await
            .unwrap();

        let addrs = group.local_addrs();
        assert_eq!(addrs.len(), 2);
        assert_ne!(addrs[0], addrs[1]);
        assert_eq!(group.stats().len(), 2);
    }

    #[tokio::test]
    async fn test_group_bind_failure_releases_bound_listeners() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let free_port = free.local_addr().unwrap().port();
        drop(free);

        let result = ServerGroup::bind(
            [config(free_port), config(taken_port)],
            Arc::new(BufferPool::new()),
        )
        .await;
        assert!(matches!(result, Err(ProxyError::Bind { .. })));

        // The first listener was dropped along with the failed group.
        assert!(TcpListener::bind(("127.0.0.1", free_port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_group_stops_on_shutdown() {
        let group = ServerGroup::bind([config(0), config(0)], Arc::new(BufferPool::new()))
            .await
            .unwrap();
        let addrs = group.local_addrs();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(group.run(shutdown.clone()));
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        for addr in addrs {
            assert!(TcpStream::connect(addr).await.is_err());
        }
    }

    type Task = Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send>>;

    fn accept_failure(addr: &str) -> ProxyError {
        ProxyError::Accept {
            addr: addr.parse().unwrap(),
            source: io::Error::other("listener closed"),
        }
    }

    #[tokio::test]
    async fn test_failing_task_cancels_siblings_and_is_returned() {
        let shutdown = CancellationToken::new();
        let scope = shutdown.child_token();

        let sibling_scope = scope.clone();
        let sibling = async move {
            sibling_scope.cancelled().await;
            Ok::<(), ProxyError>(())
        };
        let failing = async { Err::<(), _>(accept_failure("127.0.0.1:8888")) };

        let tasks = vec![Box::pin(sibling) as Task, Box::pin(failing) as Task];
        let result = tokio::time::timeout(Duration::from_secs(2), join_scoped(tasks, scope.clone()))
            .await
            .unwrap();

        match result {
            Err(ProxyError::Accept { addr, .. }) => assert_eq!(addr.port(), 8888),
            other => panic!("Expected Accept error, got {:?}", other),
        }
        assert!(scope.is_cancelled());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let scope = CancellationToken::new();

        let first = async { Err::<(), _>(accept_failure("127.0.0.1:1000")) };
        let later_scope = scope.clone();
        let later = async move {
            later_scope.cancelled().await;
            Err::<(), _>(accept_failure("127.0.0.1:2000"))
        };

        let tasks = vec![Box::pin(first) as Task, Box::pin(later) as Task];

        match join_scoped(tasks, scope).await {
            Err(ProxyError::Accept { addr, .. }) => assert_eq!(addr.port(), 1000),
            other => panic!("Expected first Accept error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let scope = CancellationToken::new();

        let sibling_scope = scope.clone();
        let sibling = async move {
            sibling_scope.cancelled().await;
            Ok::<(), ProxyError>(())
        };
        let panicking = async {
            if std::hint::black_box(true) {
                panic!("acceptor bug");
            }
            Ok::<(), ProxyError>(())
        };

        let tasks = vec![Box::pin(sibling) as Task, Box::pin(panicking) as Task];
        let result = tokio::time::timeout(Duration::from_secs(2), join_scoped(tasks, scope))
            .await
            .unwrap();

        assert!(matches!(result, Err(ProxyError::Task(_))));
    }

    #[tokio::test]
    async fn test_run_server_group_with_cancelled_token() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        run_server_group([config(0), config(0)], shutdown)
            .await
            .unwrap();
    }
}
