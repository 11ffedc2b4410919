//! Tests for lock renewal.

use super::*;
use crate::config::InMemoryConfig;
use crate::lock_registry::LockState;
use crate::message::EntityPath;
use crate::providers::{InMemoryBroker, InjectedFault};
use crate::receive::ReceiveEngine;
use crate::settlement::SettlementCoordinator;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    broker: InMemoryBroker,
    path: EntityPath,
    transport: Arc<dyn Transport>,
    registry: Arc<LockRegistry>,
    engine: ReceiveEngine,
    coordinator: SettlementCoordinator,
    manager: Arc<LockRenewalManager>,
}

fn fixture(config: InMemoryConfig, mode: ReceiveMode) -> Fixture {
    let broker = InMemoryBroker::new(config);
    let path = EntityPath::new("orders".to_string()).unwrap();
    let transport: Arc<dyn Transport> = Arc::new(broker.link(&path));
    let registry = Arc::new(LockRegistry::new(Duration::from_secs(30)));
    let engine = ReceiveEngine::new(
        Arc::clone(&registry),
        Arc::clone(&transport),
        mode,
        OPERATION_TIMEOUT,
        100,
    );
    let coordinator = SettlementCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&transport),
        mode,
        OPERATION_TIMEOUT,
    );
    let manager = Arc::new(LockRenewalManager::new(
        Arc::clone(&registry),
        Arc::clone(&transport),
        mode,
        OPERATION_TIMEOUT,
    ));
    Fixture {
        broker,
        path,
        transport,
        registry,
        engine,
        coordinator,
        manager,
    }
}

fn peek_lock() -> Fixture {
    fixture(InMemoryConfig::default(), ReceiveMode::PeekLock)
}

/// Fixture whose locks last 400ms and are auto-renewed 300ms before expiry
fn short_locks(max_auto_renew: Duration) -> Fixture {
    let mut f = fixture(
        InMemoryConfig::default().with_lock_duration(Duration::from_millis(400)),
        ReceiveMode::PeekLock,
    );
    f.manager = Arc::new(
        LockRenewalManager::new(
            Arc::clone(&f.registry),
            Arc::clone(&f.transport),
            ReceiveMode::PeekLock,
            OPERATION_TIMEOUT,
        )
        .with_auto_renew(Duration::from_millis(300), max_auto_renew),
    );
    f
}

impl Fixture {
    async fn receive_token(&self) -> LockToken {
        self.broker.enqueue(&self.path, "work");
        self.engine.receive(1, Duration::ZERO).await.unwrap()[0]
            .lock_token()
            .unwrap()
    }
}

// ============================================================================
// Renew Lock Tests
// ============================================================================

mod renew_lock_tests {
    use super::*;

    /// Verify that successive renewals move the expiry strictly forward.
    #[tokio::test]
    async fn test_renewal_extends_strictly_forward() {
        let f = peek_lock();
        let token = f.receive_token().await;
        let original = f.registry.lookup(token).unwrap().locked_until();

        let first = f.manager.renew_lock(token).await.unwrap();
        let second = f.manager.renew_lock(token).await.unwrap();

        assert!(first > original);
        assert!(second > first);
        let entry = f.registry.lookup(token).unwrap();
        assert_eq!(entry.locked_until(), second);
        assert_eq!(entry.state(), LockState::Locked);
    }

    /// Verify that an unknown token fails without a broker request.
    #[tokio::test]
    async fn test_unknown_token() {
        let f = peek_lock();

        let result = f.manager.renew_lock(LockToken::new()).await;

        assert!(matches!(result, Err(ReceiverError::LockLost { .. })));
        assert_eq!(f.broker.request_count(RequestType::RenewLock), 0);
    }

    /// Verify that renewal loses to a settlement already in progress.
    #[tokio::test]
    async fn test_renewal_while_completing() {
        let f = peek_lock();
        let token = f.receive_token().await;
        assert!(f.registry.mark_settling(token));

        let result = f.manager.renew_lock(token).await;

        assert!(matches!(result, Err(ReceiverError::LockLost { .. })));
        assert_eq!(
            f.registry.lookup(token).unwrap().state(),
            LockState::Completing
        );
    }

    /// Verify that renewal after settlement reports a lost lock.
    #[tokio::test]
    async fn test_renewal_after_settlement() {
        let f = peek_lock();
        let token = f.receive_token().await;
        f.coordinator.complete(token).await.unwrap();

        let result = f.manager.renew_lock(token).await;

        assert!(matches!(result, Err(ReceiverError::LockLost { .. })));
        assert_eq!(
            f.registry.lookup(token).unwrap().state(),
            LockState::Settled
        );
    }

    /// Verify that an entry whose settlement was rejected can still be renewed.
    #[tokio::test]
    async fn test_renewal_of_failed_entry() {
        let f = peek_lock();
        let token = f.receive_token().await;
        assert!(f.registry.mark_settling(token));
        assert!(f.registry.mark_failed(token));

        f.manager.renew_lock(token).await.unwrap();

        assert_eq!(f.registry.lookup(token).unwrap().state(), LockState::Failed);
    }

    /// Verify that a broker-side lock loss expires the entry.
    #[tokio::test]
    async fn test_broker_lock_lost() {
        let f = peek_lock();
        let token = f.receive_token().await;
        f.broker.expire_locks(&f.path);

        let result = f.manager.renew_lock(token).await;

        assert!(matches!(result, Err(ReceiverError::LockLost { .. })));
        assert_eq!(
            f.registry.lookup(token).unwrap().state(),
            LockState::Expired
        );
    }

    /// Verify that a transport failure leaves the entry untouched.
    #[tokio::test]
    async fn test_transport_failure_leaves_entry_unchanged() {
        let f = peek_lock();
        let token = f.receive_token().await;
        let before = f.registry.lookup(token).unwrap();
        f.broker.inject_fault(
            RequestType::RenewLock,
            InjectedFault::Fail(TransportError::ConnectionFailed {
                message: "connection reset".to_string(),
            }),
        );

        let result = f.manager.renew_lock(token).await;

        assert!(matches!(result, Err(ReceiverError::Transport { .. })));
        let after = f.registry.lookup(token).unwrap();
        assert_eq!(after.state(), LockState::Locked);
        assert_eq!(after.locked_until(), before.locked_until());
    }

    /// Verify that renewal is refused in receive-and-delete mode.
    #[tokio::test]
    async fn test_receive_and_delete_mode_is_invalid() {
        let f = fixture(InMemoryConfig::default(), ReceiveMode::ReceiveAndDelete);

        let result = f.manager.renew_lock(LockToken::new()).await;

        assert!(matches!(result, Err(ReceiverError::InvalidOperation { .. })));
    }
}

// ============================================================================
// Auto-Renew Tests
// ============================================================================

mod auto_renew_tests {
    use super::*;

    /// Verify that auto-renewal keeps a lock alive past its original expiry.
    #[tokio::test]
    async fn test_auto_renew_keeps_lock_alive() {
        let f = short_locks(Duration::from_secs(60));
        let token = f.receive_token().await;

        let handle = f.manager.start_auto_renew(token).unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(handle.lock_token(), token);
        assert!(!handle.is_finished());
        assert!(f.broker.request_count(RequestType::RenewLock) >= 2);
        f.coordinator.complete(token).await.unwrap();

        handle.stop();
    }

    /// Verify that auto-renewal ends once the message is settled.
    #[tokio::test]
    async fn test_auto_renew_stops_after_settlement() {
        let f = short_locks(Duration::from_secs(60));
        let token = f.receive_token().await;
        let handle = f.manager.start_auto_renew(token).unwrap();

        f.coordinator.complete(token).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(handle.is_finished());
    }

    /// Verify that auto-renewal gives up after its maximum duration.
    #[tokio::test]
    async fn test_auto_renew_respects_max_duration() {
        let f = short_locks(Duration::from_millis(200));
        let token = f.receive_token().await;
        let handle = f.manager.start_auto_renew(token).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(handle.is_finished());
        assert!(f.broker.request_count(RequestType::RenewLock) <= 2);
    }

    /// Verify that auto-renewal outside a runtime is refused instead of panicking.
    #[test]
    fn test_auto_renew_without_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (f, token) = runtime.block_on(async {
            let f = peek_lock();
            let token = f.receive_token().await;
            (f, token)
        });

        let result = f.manager.start_auto_renew(token);

        assert!(matches!(result, Err(ReceiverError::InvalidOperation { .. })));
    }

    /// Verify that stop aborts the background task.
    #[tokio::test]
    async fn test_stop_aborts_task() {
        let f = short_locks(Duration::from_secs(60));
        let token = f.receive_token().await;
        let handle = f.manager.start_auto_renew(token).unwrap();

        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.is_finished());
    }
}
