//! Query result cache.
//!
//! Results are shared by every operation of one service class user
//! and cleared as a whole at a fixed interval.
//! There is no per-entry expiry.
use dicom_object::InMemDicomObject;
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// The key of a cached result list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey<'a> {
    /// the series of one study
    SeriesOfStudy(&'a str),
    /// one series
    Series(&'a str),
    /// one study
    Study(&'a str),
    /// the studies of a patient on a given peer
    Patient {
        called_ae_title: &'a str,
        port: u16,
        host: &'a str,
        patient_id: &'a str,
        patient_name: &'a str,
    },
    /// the instances of one study
    InstancesOfStudy(&'a str),
    /// the instances of one series
    InstancesOfSeries(&'a str),
}

impl fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::SeriesOfStudy(uid) => write!(f, "series-of-study|{}", uid),
            CacheKey::Series(uid) => write!(f, "series|{}", uid),
            CacheKey::Study(uid) => write!(f, "study|{}", uid),
            CacheKey::Patient {
                called_ae_title,
                port,
                host,
                patient_id,
                patient_name,
            } => write!(
                f,
                "patient|{}|{}|{}|{}|{}",
                called_ae_title, port, host, patient_id, patient_name
            ),
            CacheKey::InstancesOfStudy(uid) => write!(f, "instances-of-study|{}", uid),
            CacheKey::InstancesOfSeries(uid) => write!(f, "instances-of-series|{}", uid),
        }
    }
}

/// A thread-safe map from query keys to result lists.
///
/// Cloning the cache yields another handle to the same entries.
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    entries: Arc<Mutex<HashMap<String, Vec<InMemDicomObject>>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<InMemDicomObject>>> {
        // the map stays consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the results cached under the given key.
    pub fn get(&self, key: &CacheKey<'_>) -> Option<Vec<InMemDicomObject>> {
        self.lock().get(&key.to_string()).cloned()
    }

    pub fn contains(&self, key: &CacheKey<'_>) -> bool {
        self.lock().contains_key(&key.to_string())
    }

    /// Cache a result list.
    ///
    /// Empty lists are not cached,
    /// and an entry already present is kept.
    /// Returns whether the list was inserted.
    pub fn insert(&self, key: &CacheKey<'_>, results: &[InMemDicomObject]) -> bool {
        if results.is_empty() {
            return false;
        }
        let mut entries = self.lock();
        let key = key.to_string();
        if entries.contains_key(&key) {
            return false;
        }
        debug!("Caching {} results under {}", results.len(), key);
        entries.insert(key, results.to_vec());
        true
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A background thread clearing a cache at a fixed interval.
///
/// The thread is stopped and joined when this value is dropped.
#[derive(Debug)]
pub struct CacheInvalidator {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CacheInvalidator {
    pub fn spawn(cache: ResultCache, interval: Duration) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("cache-invalidator".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        info!("Clearing cache");
                        cache.clear();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(CacheInvalidator {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for CacheInvalidator {
    fn drop(&mut self) {
        // disconnecting the channel wakes the thread up
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
