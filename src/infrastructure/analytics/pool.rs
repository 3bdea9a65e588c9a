use clickhouse::Client;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// Bounded pool of analytical-store clients.
///
/// Sized to the consumer's `max_concurrent_messages` so a handler can always
/// acquire without starving its siblings. `acquire()` suspends until a
/// client is free; the guard returns it on drop along every exit path,
/// including cancellation.
#[derive(Clone)]
pub struct AnalyticsPool {
    clients: Arc<Mutex<Vec<Client>>>,
    permits: Arc<Semaphore>,
}

/// Connection coordinates for the analytical store.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl AnalyticsPool {
    pub fn new(config: &AnalyticsConfig, size: usize) -> AnalyticsPool {
        let size = size.max(1);
        let clients: Vec<Client> = (0..size).map(|_| build_client(config)).collect();
        info!(
            "Analytics pool ready: {} clients against {}",
            size, config.url
        );
        AnalyticsPool {
            clients: Arc::new(Mutex::new(clients)),
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    /// Borrows a client, suspending while the pool is exhausted.
    pub async fn acquire(&self) -> AnalyticsClientGuard {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("analytics pool semaphore closed");
        let client = self
            .clients
            .lock()
            .unwrap()
            .pop()
            .expect("pool invariant: permit held but no client available");
        AnalyticsClientGuard {
            client: Some(client),
            clients: Arc::clone(&self.clients),
            _permit: permit,
        }
    }
}

fn build_client(config: &AnalyticsConfig) -> Client {
    Client::default()
        .with_url(&config.url)
        .with_database(&config.database)
        .with_user(&config.user)
        .with_password(&config.password)
}

/// RAII client borrow; the client returns to the pool on drop.
pub struct AnalyticsClientGuard {
    client: Option<Client>,
    clients: Arc<Mutex<Vec<Client>>>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for AnalyticsClientGuard {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("client taken")
    }
}

impl Drop for AnalyticsClientGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.clients.lock().unwrap().push(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AnalyticsConfig {
        AnalyticsConfig {
            url: "http://localhost:8123".to_string(),
            database: "trader".to_string(),
            user: "default".to_string(),
            password: String::new(),
        }
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = AnalyticsPool::new(&test_config(), 2);
        let a = pool.acquire().await;
        let b = pool.acquire().await;
        assert_eq!(pool.clients.lock().unwrap().len(), 0);
        drop(a);
        drop(b);
        assert_eq!(pool.clients.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_free_client() {
        let pool = AnalyticsPool::new(&test_config(), 1);
        let guard = pool.acquire().await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let _guard = pool2.acquire().await;
        });

        // The waiter cannot finish while the only client is borrowed.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
