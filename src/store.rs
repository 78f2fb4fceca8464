//! In-memory key/value and key/list state with millisecond TTLs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::utils::GeomysError;

/// A single string entry with an optional absolute expiry timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    value: String,
    expires_at: Option<u64>,
}

impl Entry {
    fn expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

/// State maps. A key is bound to at most one of the two maps at a time.
#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
}

/// The in-memory store. One exclusion domain guards all of it; operations
/// are short and perform no I/O under the lock.
#[derive(Debug, Default)]
pub struct Store {
    inner: Mutex<StoreInner>,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

impl Store {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Store::default()
    }

    /// Sets `key` to `value`. TTL `<= 0` means no expiry; a positive TTL
    /// sets the expiry to `now + ttl_ms`.
    pub fn set(
        &self,
        key: &str,
        value: &str,
        ttl_ms: i64,
    ) -> Result<(), GeomysError> {
        if key.is_empty() || value.is_empty() {
            return Err(GeomysError::InvalidArgument(
                "key and value must be non-empty".into(),
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.lists.contains_key(key) {
            return Err(GeomysError::TypeMismatch(
                "key is bound to a list".into(),
            ));
        }

        let expires_at = if ttl_ms > 0 {
            Some(now_ms() + ttl_ms as u64)
        } else {
            None
        };
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    /// Gets the value of `key`. An expired entry behaves as absent (and is
    /// reclaimed on the spot; the sweeper reclaims the ones never read).
    pub fn get(&self, key: &str) -> Result<String, GeomysError> {
        let mut inner = self.inner.lock().unwrap();
        if Self::drop_if_expired(&mut inner, key) {
            return Err(GeomysError::NotFound("key not found".into()));
        }
        match inner.entries.get(key) {
            Some(entry) => Ok(entry.value.clone()),
            None => Err(GeomysError::NotFound("key not found".into())),
        }
    }

    /// Adds `delta` to the integer value stored at `key` and returns the
    /// new value. The stored value is overwritten with the decimal string
    /// of the result; the expiry is left untouched.
    pub fn incr(&self, key: &str, delta: i64) -> Result<i64, GeomysError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lists.contains_key(key) {
            return Err(GeomysError::TypeMismatch(
                "key is bound to a list".into(),
            ));
        }
        if Self::drop_if_expired(&mut inner, key) {
            return Err(GeomysError::NotFound("key not found".into()));
        }

        let entry = inner
            .entries
            .get_mut(key)
            .ok_or_else(|| GeomysError::NotFound("key not found".into()))?;
        let current: i64 = entry.value.parse().map_err(|_| {
            GeomysError::TypeMismatch("value is not an integer".into())
        })?;
        let new_value = current + delta;
        entry.value = new_value.to_string();
        Ok(new_value)
    }

    /// Removes `key` if its entry has expired. Returns whether it did.
    fn drop_if_expired(inner: &mut StoreInner, key: &str) -> bool {
        let expired =
            matches!(inner.entries.get(key), Some(e) if e.expired(now_ms()));
        if expired {
            inner.entries.remove(key);
        }
        expired
    }

    /// Appends `value` to the tail of the list at `key`, creating the list
    /// lazily on first push.
    pub fn push(&self, key: &str, value: &str) -> Result<(), GeomysError> {
        self.push_inner(key, value, false)
    }

    /// Prepends `value` to the head of the list at `key`, creating the
    /// list lazily on first push.
    pub fn lpush(&self, key: &str, value: &str) -> Result<(), GeomysError> {
        self.push_inner(key, value, true)
    }

    fn push_inner(
        &self,
        key: &str,
        value: &str,
        front: bool,
    ) -> Result<(), GeomysError> {
        if key.is_empty() || value.is_empty() {
            return Err(GeomysError::InvalidArgument(
                "key and value must be non-empty".into(),
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(key) {
            return Err(GeomysError::TypeMismatch(
                "key is bound to a string value".into(),
            ));
        }

        let list = inner.lists.entry(key.to_string()).or_default();
        if front {
            list.push_front(value.to_string());
        } else {
            list.push_back(value.to_string());
        }
        Ok(())
    }

    /// Pops from the head of the list at `key`. An emptied list remains
    /// addressable; popping it again fails.
    pub fn lpop(&self, key: &str) -> Result<String, GeomysError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.lists.get_mut(key) {
            Some(list) => list.pop_front().ok_or_else(|| {
                GeomysError::NotFound("list is empty".into())
            }),
            None => Err(GeomysError::NotFound("list not found".into())),
        }
    }

    /// Pops from the tail of the list at `key`.
    pub fn rpop(&self, key: &str) -> Result<String, GeomysError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.lists.get_mut(key) {
            Some(list) => list.pop_back().ok_or_else(|| {
                GeomysError::NotFound("list is empty".into())
            }),
            None => Err(GeomysError::NotFound("list not found".into())),
        }
    }

    /// Number of elements in the list at `key`.
    pub fn len(&self, key: &str) -> Result<usize, GeomysError> {
        let inner = self.inner.lock().unwrap();
        match inner.lists.get(key) {
            Some(list) => Ok(list.len()),
            None => Err(GeomysError::NotFound("list not found".into())),
        }
    }

    /// Discards all entries, expiries, and lists.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.lists.clear();
    }

    /// Removes every entry whose expiry has passed.
    fn sweep(&self) {
        let now = now_ms();
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|_, entry| !entry.expired(now));
    }

    /// Spawns the recurring sweeper task waking every `interval`.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use rand::{seq::SliceRandom, Rng};

    #[test]
    fn get_empty() {
        let store = Store::new();
        assert_eq!(
            store.get("missing"),
            Err(GeomysError::NotFound("key not found".into()))
        );
    }

    #[test]
    fn set_one_get_one() -> Result<(), GeomysError> {
        let store = Store::new();
        store.set("foo", "bar", 0)?;
        assert_eq!(store.get("foo")?, "bar");
        Ok(())
    }

    #[test]
    fn set_rejects_empty() {
        let store = Store::new();
        assert!(matches!(
            store.set("", "v", 0),
            Err(GeomysError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.set("k", "", 0),
            Err(GeomysError::InvalidArgument(_))
        ));
    }

    #[test]
    fn set_overwrites() -> Result<(), GeomysError> {
        let store = Store::new();
        store.set("k", "179", 0)?;
        store.set("k", "180", 0)?;
        assert_eq!(store.get("k")?, "180");
        Ok(())
    }

    #[test]
    fn incr_basic() -> Result<(), GeomysError> {
        let store = Store::new();
        store.set("counter", "10", 0)?;
        assert_eq!(store.incr("counter", 5)?, 15);
        assert_eq!(store.get("counter")?, "15");
        Ok(())
    }

    #[test]
    fn incr_large_value() -> Result<(), GeomysError> {
        let store = Store::new();
        store.set("counter", "999999999999", 0)?;
        assert_eq!(store.incr("counter", 1)?, 1000000000000);
        assert_eq!(store.get("counter")?, "1000000000000");
        Ok(())
    }

    #[test]
    fn incr_negative_delta() -> Result<(), GeomysError> {
        let store = Store::new();
        store.set("counter", "3", 0)?;
        assert_eq!(store.incr("counter", -5)?, -2);
        Ok(())
    }

    #[test]
    fn incr_missing_key() {
        let store = Store::new();
        assert_eq!(
            store.incr("nonexistent", 3),
            Err(GeomysError::NotFound("key not found".into()))
        );
    }

    #[test]
    fn incr_non_integer() -> Result<(), GeomysError> {
        let store = Store::new();
        store.set("str", "hello", 0)?;
        assert_eq!(
            store.incr("str", 2),
            Err(GeomysError::TypeMismatch("value is not an integer".into()))
        );
        Ok(())
    }

    #[test]
    fn push_pop_fifo() -> Result<(), GeomysError> {
        let store = Store::new();
        store.push("list", "item1")?;
        store.push("list", "item2")?;
        store.push("list", "item3")?;
        assert_eq!(store.len("list")?, 3);
        assert_eq!(store.lpop("list")?, "item1");
        assert_eq!(store.lpop("list")?, "item2");
        assert_eq!(store.rpop("list")?, "item3");
        assert_eq!(
            store.lpop("list"),
            Err(GeomysError::NotFound("list is empty".into()))
        );
        // emptied list stays addressable
        assert_eq!(store.len("list")?, 0);
        Ok(())
    }

    #[test]
    fn lpush_prepends() -> Result<(), GeomysError> {
        let store = Store::new();
        store.push("list", "middle")?;
        store.lpush("list", "first")?;
        store.push("list", "last")?;
        assert_eq!(store.lpop("list")?, "first");
        assert_eq!(store.lpop("list")?, "middle");
        assert_eq!(store.lpop("list")?, "last");
        Ok(())
    }

    #[test]
    fn pop_missing_list() {
        let store = Store::new();
        assert_eq!(
            store.rpop("nope"),
            Err(GeomysError::NotFound("list not found".into()))
        );
    }

    #[test]
    fn type_bindings_exclusive() -> Result<(), GeomysError> {
        let store = Store::new();
        store.set("strkey", "v", 0)?;
        assert!(matches!(
            store.push("strkey", "item"),
            Err(GeomysError::TypeMismatch(_))
        ));
        store.push("listkey", "item")?;
        assert!(matches!(
            store.set("listkey", "v", 0),
            Err(GeomysError::TypeMismatch(_))
        ));
        assert!(matches!(
            store.incr("listkey", 1),
            Err(GeomysError::TypeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn clear_discards_everything() -> Result<(), GeomysError> {
        let store = Store::new();
        store.set("k", "v", 0)?;
        store.push("l", "item")?;
        store.clear();
        assert!(store.get("k").is_err());
        assert!(store.len("l").is_err());
        Ok(())
    }

    #[test]
    fn set_rand_get_rand() -> Result<(), GeomysError> {
        let store = Store::new();
        let mut ref_map = HashMap::new();
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let key: String = (0..1)
                .map(|_| rng.gen_range(b'a'..=b'z') as char)
                .collect();
            let value: String = (0..10)
                .map(|_| rng.gen_range(b'a'..=b'z') as char)
                .collect();
            store.set(&key, &value, 0)?;
            ref_map.insert(key, value);
        }
        let keys: Vec<&String> = ref_map.keys().collect();
        for _ in 0..100 {
            let key: String = if rand::random() {
                (*keys.choose(&mut rng).unwrap()).into()
            } else {
                "nonexist!".into()
            };
            match ref_map.get(&key) {
                Some(value) => assert_eq!(&store.get(&key)?, value),
                None => assert!(store.get(&key).is_err()),
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn entry_expires() -> Result<(), GeomysError> {
        let store = Arc::new(Store::new());
        store.start_sweeper(Duration::from_millis(100));
        store.set("tempkey", "tempvalue", 500)?;
        store.set("stays", "here", 0)?;

        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get("tempkey")?, "tempvalue");

        time::sleep(Duration::from_millis(300)).await;
        assert!(store.get("tempkey").is_err());
        assert_eq!(store.get("stays")?, "here");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sweeper_reclaims_unread() -> Result<(), GeomysError> {
        let store = Arc::new(Store::new());
        store.start_sweeper(Duration::from_millis(50));
        store.set("gone", "soon", 100)?;

        time::sleep(Duration::from_millis(300)).await;
        // reclaimed by the sweeper, not by a read
        assert_eq!(store.inner.lock().unwrap().entries.len(), 0);
        Ok(())
    }
}
