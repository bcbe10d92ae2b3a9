//! Именованные таймеры поверх tokio.
//!
//! Каждый владелец (соединение, потребитель, lookup) держит свой
//! [`Timers`] со своим типом ключа. Повторная постановка таймера с тем же
//! ключом отменяет предыдущий, поэтому ключ однозначно определяет
//! ожидающее действие.

use std::{collections::HashMap, fmt::Debug, future::Future, hash::Hash, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

struct Entry {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Registry<K> {
    next_generation: u64,
    entries: HashMap<K, Entry>,
}

/// Набор отменяемых таймеров, адресуемых ключом `K`.
pub struct Timers<K> {
    registry: Arc<Mutex<Registry<K>>>,
}

impl<K> Clone for Timers<K> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_generation: 0,
                entries: HashMap::new(),
            })),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl<K> Timers<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Однократный таймер: `task` выполнится через `delay`.
    ///
    /// Перед запуском `task` ключ освобождается, так что внутри `task`
    /// можно снова поставить таймер с тем же ключом.
    pub fn after<F>(
        &self,
        key: K,
        delay: Duration,
        task: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut registry = self.registry.lock();
        let generation = registry.next_generation;
        registry.next_generation += 1;

        let shared = Arc::clone(&self.registry);
        let own_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut registry = shared.lock();
                if registry
                    .entries
                    .get(&own_key)
                    .is_some_and(|e| e.generation == generation)
                {
                    registry.entries.remove(&own_key);
                }
            }
            trace!(key = ?own_key, "timer fired");
            task.await;
        });

        if let Some(old) = registry.entries.insert(key, Entry { generation, handle }) {
            old.handle.abort();
        }
    }

    /// Периодический таймер: `task` вызывается каждые `interval`, первый
    /// раз через `interval` после постановки.
    pub fn tick<F, Fut>(
        &self,
        key: K,
        interval: Duration,
        mut task: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut registry = self.registry.lock();
        let generation = registry.next_generation;
        registry.next_generation += 1;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                task().await;
            }
        });

        if let Some(old) = registry.entries.insert(key, Entry { generation, handle }) {
            old.handle.abort();
        }
    }

    /// Отменяет таймер. Возвращает `true`, если он ещё ожидал срабатывания.
    pub fn cancel(
        &self,
        key: &K,
    ) -> bool {
        match self.registry.lock().entries.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn contains(
        &self,
        key: &K,
    ) -> bool {
        self.registry.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        let entries: Vec<Entry> = self
            .registry
            .lock()
            .entries
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.handle.abort();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Key {
        A,
        B,
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once_and_forgets_key() {
        let timers = Timers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        timers.after(Key::A, Duration::from_secs(1), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.contains(&Key::A));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timers.contains(&Key::A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let timers = Timers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        timers.after(Key::A, Duration::from_secs(1), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timers.cancel(&Key::A));
        assert!(!timers.cancel(&Key::A));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// Тест проверяет, что повторная постановка с тем же ключом отменяет
    /// предыдущий таймер.
    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous() {
        let timers = Timers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for delay in [1u64, 3] {
            let h = Arc::clone(&hits);
            timers.after(Key::A, Duration::from_secs(delay), async move {
                h.fetch_add(delay as usize, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_repeats_until_cancelled() {
        let timers = Timers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        timers.tick(Key::B, Duration::from_secs(1), move || {
            let h = Arc::clone(&h);
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        timers.cancel_all();
        assert!(timers.is_empty());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
