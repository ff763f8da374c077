//! Type-indexed service registry.
//!
//! An execution context owns one [`ServiceRegistry`]: a container of
//! per-context singletons (scheduler, socket service, timer service,
//! signal service) indexed by type. Each service is stored at most
//! once and may declare a secondary key type, under which the same
//! instance is also found; this is how an abstract lookup resolves
//! to the concrete backend that was installed.
//!
//! # Construction protocol
//!
//! [`ServiceRegistry::use_service`] is double-checked: the lookup runs
//! under the registry lock, construction runs outside it (so a service
//! constructor may freely `use_service` its own dependencies without
//! deadlocking), and the insert re-checks. If another thread won the
//! race, the winner is kept and the loser dropped.
//!
//! # Shutdown
//!
//! Teardown is two-phase and LIFO: every service's `shutdown()` is
//! called, most recently created first, before any service is dropped.
//! Services may reference each other during shutdown; they must not
//! create new services.

use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A per-context singleton managed by the [`ServiceRegistry`].
pub trait Service: Any + Send + Sync {
    /// Called once during registry teardown, in reverse creation
    /// order, before any service is dropped.
    fn shutdown(&self) {}
}

/// A service type that can be stored in the registry.
///
/// `Key` is the secondary index: looking the registry up under the key
/// type finds this service. Most services use `Key = Self`.
pub trait RegisteredService: Service + Sized {
    /// Secondary lookup key type.
    type Key: 'static;
}

/// A service constructible on demand by [`ServiceRegistry::use_service`].
pub trait DefaultService: RegisteredService {
    /// Builds the service. Runs outside the registry lock; nested
    /// `use_service` calls are permitted.
    fn create(registry: &Arc<ServiceRegistry>) -> Self;
}

struct Entry {
    concrete: TypeId,
    key: TypeId,
    service: Arc<dyn Service>,
    any: Arc<dyn Any + Send + Sync>,
}

/// A container of polymorphic per-context services.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: Mutex<Vec<Entry>>,
    shut: AtomicBool,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the service registered as `T` (or under key `T`), if any.
    #[must_use]
    pub fn find_service<T: RegisteredService>(&self) -> Option<Arc<T>> {
        let id = TypeId::of::<T>();
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| e.concrete == id || e.key == id)
            .and_then(|e| e.any.clone().downcast::<T>().ok())
    }

    /// Returns the service of type `T`, creating it if needed.
    ///
    /// # Panics
    ///
    /// Panics if called after the registry has been shut down.
    pub fn use_service<T: DefaultService>(self: &Arc<Self>) -> Arc<T> {
        assert!(
            !self.shut.load(Ordering::Acquire),
            "use_service on a shut-down context"
        );
        if let Some(existing) = self.find_service::<T>() {
            return existing;
        }

        // Construct outside the lock so nested use_service calls in
        // the constructor cannot deadlock.
        let candidate = Arc::new(T::create(self));

        let mut entries = self.entries.lock();
        if let Some(winner) = entries
            .iter()
            .find(|e| e.concrete == TypeId::of::<T>())
            .and_then(|e| e.any.clone().downcast::<T>().ok())
        {
            // Another thread won the race; prefer the winner.
            return winner;
        }
        entries.push(Entry {
            concrete: TypeId::of::<T>(),
            key: TypeId::of::<T::Key>(),
            service: candidate.clone(),
            any: candidate.clone(),
        });
        candidate
    }

    /// Constructs and registers a service of type `T`.
    ///
    /// Fails with [`ErrorKind::AlreadyExists`] if a service of the
    /// same concrete type or the same key type is present, whether the
    /// conflict existed before construction or arose concurrently.
    pub fn make_service<T, F>(self: &Arc<Self>, init: F) -> Result<Arc<T>>
    where
        T: RegisteredService,
        F: FnOnce() -> io::Result<T>,
    {
        self.check_conflict::<T>()?;

        // Unlocked to allow nested service creation from the
        // constructor.
        let service = Arc::new(init()?);

        let mut entries = self.entries.lock();
        let concrete = TypeId::of::<T>();
        let key = TypeId::of::<T::Key>();
        if entries
            .iter()
            .any(|e| e.concrete == concrete || e.key == concrete || e.concrete == key || e.key == key)
        {
            return Err(Error::new(ErrorKind::AlreadyExists).with_context("service already exists"));
        }
        entries.push(Entry {
            concrete,
            key,
            service: service.clone(),
            any: service.clone(),
        });
        Ok(service)
    }

    fn check_conflict<T: RegisteredService>(&self) -> Result<()> {
        let concrete = TypeId::of::<T>();
        let key = TypeId::of::<T::Key>();
        let entries = self.entries.lock();
        if entries
            .iter()
            .any(|e| e.concrete == concrete || e.key == concrete || e.concrete == key || e.key == key)
        {
            return Err(Error::new(ErrorKind::AlreadyExists).with_context("service already exists"));
        }
        Ok(())
    }

    /// Runs the two-phase LIFO teardown: `shutdown()` on every service
    /// in reverse creation order, then drops them all.
    pub(crate) fn shutdown_all(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries = std::mem::take(&mut *self.entries.lock());
        for entry in entries.iter().rev() {
            entry.service.shutdown();
        }
        drop(entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static SHUTDOWN_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    struct Alpha;
    impl Service for Alpha {
        fn shutdown(&self) {
            SHUTDOWN_ORDER.lock().push("alpha");
        }
    }
    impl RegisteredService for Alpha {
        type Key = Alpha;
    }
    impl DefaultService for Alpha {
        fn create(_: &Arc<ServiceRegistry>) -> Self {
            Alpha
        }
    }

    struct Beta;
    impl Service for Beta {
        fn shutdown(&self) {
            SHUTDOWN_ORDER.lock().push("beta");
        }
    }
    impl RegisteredService for Beta {
        type Key = Beta;
    }
    impl DefaultService for Beta {
        fn create(registry: &Arc<ServiceRegistry>) -> Self {
            // Nested construction must not deadlock.
            let _ = registry.use_service::<Alpha>();
            Beta
        }
    }

    // Two backends sharing one key type.
    struct BackendKey;
    #[derive(Debug)]
    struct BackendA(usize);
    impl Service for BackendA {}
    impl RegisteredService for BackendA {
        type Key = BackendKey;
    }
    #[derive(Debug)]
    struct BackendB;
    impl Service for BackendB {}
    impl RegisteredService for BackendB {
        type Key = BackendKey;
    }

    #[test]
    fn find_absent_returns_none() {
        let registry = Arc::new(ServiceRegistry::new());
        assert!(registry.find_service::<Alpha>().is_none());
    }

    #[test]
    fn use_service_creates_once() {
        let registry = Arc::new(ServiceRegistry::new());
        let a1 = registry.use_service::<Alpha>();
        let a2 = registry.use_service::<Alpha>();
        assert!(Arc::ptr_eq(&a1, &a2));
    }

    #[test]
    fn nested_use_service_in_constructor() {
        let registry = Arc::new(ServiceRegistry::new());
        let _ = registry.use_service::<Beta>();
        assert!(registry.find_service::<Alpha>().is_some());
    }

    #[test]
    fn make_service_conflicts_on_concrete_type() {
        let registry = Arc::new(ServiceRegistry::new());
        registry
            .make_service(|| Ok(BackendA(1)))
            .expect("first make");
        let err = registry
            .make_service::<BackendA, _>(|| Ok(BackendA(2)))
            .expect_err("duplicate make");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        // The first instance is the one that stays registered.
        let found = registry.find_service::<BackendA>().expect("find");
        assert_eq!(found.0, 1);
    }

    #[test]
    fn make_service_conflicts_on_key_type() {
        let registry = Arc::new(ServiceRegistry::new());
        registry
            .make_service(|| Ok(BackendA(7)))
            .expect("first make");
        let err = registry
            .make_service::<BackendB, _>(|| Ok(BackendB))
            .expect_err("key conflict");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(registry.find_service::<BackendA>().expect("find").0, 7);
    }

    #[test]
    fn use_after_make_finds_same_instance() {
        let registry = Arc::new(ServiceRegistry::new());
        let made = registry.make_service(|| Ok(BackendA(3))).expect("make");
        let found = registry.find_service::<BackendA>().expect("find");
        assert!(Arc::ptr_eq(&made, &found));
    }

    #[test]
    fn shutdown_runs_in_reverse_creation_order() {
        SHUTDOWN_ORDER.lock().clear();
        let registry = Arc::new(ServiceRegistry::new());
        let _ = registry.use_service::<Alpha>();
        let _ = registry.use_service::<Beta>();
        registry.shutdown_all();
        assert_eq!(*SHUTDOWN_ORDER.lock(), vec!["beta", "alpha"]);
    }

    #[test]
    fn shutdown_is_idempotent() {
        static SHUTDOWNS: AtomicUsize = AtomicUsize::new(0);
        struct Gamma;
        impl Service for Gamma {
            fn shutdown(&self) {
                SHUTDOWNS.fetch_add(1, Ordering::SeqCst);
            }
        }
        impl RegisteredService for Gamma {
            type Key = Gamma;
        }
        impl DefaultService for Gamma {
            fn create(_: &Arc<ServiceRegistry>) -> Self {
                Gamma
            }
        }

        let registry = Arc::new(ServiceRegistry::new());
        let _ = registry.use_service::<Gamma>();
        registry.shutdown_all();
        registry.shutdown_all();
        assert_eq!(SHUTDOWNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_use_service_yields_one_instance() {
        static CREATED: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Service for Counted {}
        impl RegisteredService for Counted {
            type Key = Counted;
        }
        impl DefaultService for Counted {
            fn create(_: &Arc<ServiceRegistry>) -> Self {
                CREATED.fetch_add(1, Ordering::SeqCst);
                Counted
            }
        }

        let registry = Arc::new(ServiceRegistry::new());
        std::thread::scope(|s| {
            for _ in 0..8 {
                let registry = registry.clone();
                s.spawn(move || {
                    let _ = registry.use_service::<Counted>();
                });
            }
        });

        // Losers may have constructed and been discarded; exactly one
        // instance must be registered.
        let first = registry.find_service::<Counted>().expect("registered");
        let again = registry.find_service::<Counted>().expect("registered");
        assert!(Arc::ptr_eq(&first, &again));
        assert!(CREATED.load(Ordering::SeqCst) >= 1);
    }
}
