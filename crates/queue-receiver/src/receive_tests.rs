//! Tests for the receive engine.

use super::*;
use crate::config::InMemoryConfig;
use crate::message::{EntityPath, LockToken};
use crate::providers::{InMemoryBroker, InjectedFault};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

fn orders() -> EntityPath {
    EntityPath::new("orders".to_string()).unwrap()
}

struct Fixture {
    broker: InMemoryBroker,
    path: EntityPath,
    transport: Arc<dyn Transport>,
    registry: Arc<LockRegistry>,
    engine: ReceiveEngine,
}

fn fixture(mode: ReceiveMode) -> Fixture {
    fixture_with(InMemoryBroker::default(), mode)
}

fn fixture_with(broker: InMemoryBroker, mode: ReceiveMode) -> Fixture {
    let path = orders();
    let transport: Arc<dyn Transport> = Arc::new(broker.link(&path));
    let registry = Arc::new(LockRegistry::new(Duration::from_secs(30)));
    let engine = ReceiveEngine::new(
        Arc::clone(&registry),
        Arc::clone(&transport),
        mode,
        OPERATION_TIMEOUT,
        100,
    );
    Fixture {
        broker,
        path,
        transport,
        registry,
        engine,
    }
}

// ============================================================================
// Receive Tests
// ============================================================================

mod receive_operation_tests {
    use super::*;

    /// Verify that every peek-lock message is registered as Locked.
    #[tokio::test]
    async fn test_receive_registers_one_entry_per_message() {
        let f = fixture(ReceiveMode::PeekLock);
        for i in 0..3 {
            f.broker.enqueue(&f.path, format!("message-{}", i));
        }

        let messages = f.engine.receive(10, Duration::ZERO).await.unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(f.registry.len(), 3);
        assert_eq!(f.registry.count_in_state(LockState::Locked), 3);
        for message in &messages {
            let entry = f.registry.lookup(message.lock_token.unwrap()).unwrap();
            assert_eq!(entry.sequence_number(), message.sequence_number);
            assert_eq!(Some(entry.locked_until()), message.locked_until);
        }
    }

    /// Verify that receive-and-delete never creates lock entries.
    #[tokio::test]
    async fn test_receive_and_delete_creates_no_entries() {
        let f = fixture(ReceiveMode::ReceiveAndDelete);
        f.broker.enqueue(&f.path, "gone");

        let messages = f.engine.receive(1, Duration::ZERO).await.unwrap();

        assert_eq!(messages.len(), 1);
        assert!(f.registry.is_empty());
        assert_eq!(f.broker.message_count(&f.path), 0);
    }

    /// Verify that an empty entity yields an empty result after the wait time.
    #[tokio::test(start_paused = true)]
    async fn test_receive_on_empty_entity_returns_empty() {
        let f = fixture(ReceiveMode::PeekLock);
        let started = tokio::time::Instant::now();

        let messages = f.engine.receive(5, Duration::from_secs(30)).await.unwrap();

        assert!(messages.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(f.registry.is_empty());
    }

    /// Verify that out-of-range counts are rejected before contacting the broker.
    #[tokio::test]
    async fn test_receive_validates_max_count() {
        let f = fixture(ReceiveMode::PeekLock);

        let zero = f.engine.receive(0, Duration::ZERO).await;
        let too_many = f.engine.receive(101, Duration::ZERO).await;

        assert!(matches!(zero, Err(ReceiverError::Validation(_))));
        assert!(matches!(too_many, Err(ReceiverError::Validation(_))));
        assert_eq!(f.broker.request_count(RequestType::Receive), 0);
    }

    /// Verify that transport failures surface without registering anything.
    #[tokio::test]
    async fn test_receive_transport_failure() {
        let f = fixture(ReceiveMode::PeekLock);
        f.broker.enqueue(&f.path, "waiting");
        f.broker.inject_fault(
            RequestType::Receive,
            InjectedFault::Fail(TransportError::ConnectionFailed {
                message: "connection reset".to_string(),
            }),
        );

        let result = f.engine.receive(1, Duration::ZERO).await;

        match result {
            Err(error @ ReceiverError::Transport { .. }) => assert!(error.is_transient()),
            other => panic!("Expected Transport error, got: {:?}", other),
        }
        assert!(f.registry.is_empty());
    }
}

// ============================================================================
// Prefetch Tests
// ============================================================================

mod prefetch_tests {
    use super::*;

    /// Verify that extra messages are registered and buffered.
    #[tokio::test]
    async fn test_prefetch_buffers_extra_messages() {
        let f = fixture(ReceiveMode::PeekLock);
        f.engine.set_prefetch_count(5);
        for i in 0..5 {
            f.broker.enqueue(&f.path, format!("message-{}", i));
        }

        let first = f.engine.receive(2, Duration::ZERO).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(f.engine.prefetched_len(), 3);
        assert_eq!(f.registry.count_in_state(LockState::Locked), 5);

        let second = f.engine.receive(2, Duration::ZERO).await.unwrap();

        assert_eq!(second.len(), 2);
        assert!(second[0].sequence_number > first[1].sequence_number);
        assert_eq!(f.engine.prefetched_len(), 1);
        assert_eq!(f.broker.request_count(RequestType::Receive), 1);
    }

    /// Verify that buffered messages whose lock lapsed are discarded.
    #[tokio::test]
    async fn test_prefetch_discards_lapsed_locks() {
        let f = fixture(ReceiveMode::PeekLock);
        f.engine.set_prefetch_count(3);
        for i in 0..3 {
            f.broker.enqueue(&f.path, format!("message-{}", i));
        }
        let returned = f.engine.receive(1, Duration::ZERO).await.unwrap();
        let returned_token = returned[0].lock_token.unwrap();

        let buffered: Vec<LockToken> = f
            .registry
            .snapshot()
            .iter()
            .map(|entry| entry.lock_token())
            .filter(|token| *token != returned_token)
            .collect();
        assert_eq!(buffered.len(), 2);
        assert!(f.registry.expire(buffered[0]));

        let next = f.engine.receive(5, Duration::ZERO).await.unwrap();

        assert_eq!(next.len(), 1);
        assert_eq!(next[0].lock_token, Some(buffered[1]));
        assert_eq!(f.engine.prefetched_len(), 0);
    }

    /// Verify that clearing the buffer reports what was dropped.
    #[tokio::test]
    async fn test_clear_prefetched() {
        let f = fixture(ReceiveMode::PeekLock);
        f.engine.set_prefetch_count(4);
        for i in 0..4 {
            f.broker.enqueue(&f.path, format!("message-{}", i));
        }
        f.engine.receive(1, Duration::ZERO).await.unwrap();

        assert_eq!(f.engine.clear_prefetched(), 3);
        assert_eq!(f.engine.prefetched_len(), 0);
        assert_eq!(f.engine.prefetch_count(), 4);
    }
}

// ============================================================================
// Receive By Sequence Number Tests
// ============================================================================

mod receive_by_sequence_tests {
    use super::*;

    /// Verify that deferred messages are retrieved in request order.
    #[tokio::test]
    async fn test_receive_deferred_messages_in_request_order() {
        let f = fixture(ReceiveMode::PeekLock);
        f.broker.enqueue(&f.path, "first");
        f.broker.enqueue(&f.path, "second");
        let messages = f.engine.receive(2, Duration::ZERO).await.unwrap();
        for message in &messages {
            let response = f
                .transport
                .send(
                    BrokerRequest::Defer {
                        lock_token: message.lock_token.unwrap(),
                    },
                    OPERATION_TIMEOUT,
                )
                .await
                .unwrap();
            assert_eq!(response, BrokerResponse::Settled);
        }

        let missing = SequenceNumber::new(999);
        let results = f
            .engine
            .receive_by_sequence_numbers(&[
                messages[1].sequence_number,
                missing,
                messages[0].sequence_number,
            ])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        let second = results[0].as_ref().unwrap();
        assert_eq!(second.sequence_number, messages[1].sequence_number);
        assert_ne!(second.lock_token, messages[1].lock_token);
        assert!(matches!(
            results[1],
            Err(ReceiverError::NotFound { sequence_number }) if sequence_number == missing
        ));
        assert_eq!(
            results[2].as_ref().unwrap().sequence_number,
            messages[0].sequence_number
        );

        let entry = f.registry.lookup(second.lock_token.unwrap()).unwrap();
        assert_eq!(entry.state(), LockState::Locked);
    }

    /// Verify that a repeated sequence number is fetched and locked once.
    #[tokio::test]
    async fn test_repeated_sequence_number_locks_once() {
        let f = fixture(ReceiveMode::PeekLock);
        f.broker.enqueue(&f.path, "later");
        let message = f.engine.receive(1, Duration::ZERO).await.unwrap().remove(0);
        let response = f
            .transport
            .send(
                BrokerRequest::Defer {
                    lock_token: message.lock_token.unwrap(),
                },
                OPERATION_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(response, BrokerResponse::Settled);
        let sequence_number = message.sequence_number;

        let results = f
            .engine
            .receive_by_sequence_numbers(&[sequence_number, sequence_number])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        let second = results[1].as_ref().unwrap();
        assert_eq!(first, second);
        assert_eq!(f.registry.count_in_state(LockState::Locked), 1);
        let entry = f.registry.lookup(first.lock_token.unwrap()).unwrap();
        assert_eq!(entry.sequence_number(), sequence_number);
    }

    /// Verify that a message this receiver already holds is not locked again.
    #[tokio::test]
    async fn test_own_live_lock_is_not_found() {
        let f = fixture(ReceiveMode::PeekLock);
        f.broker.enqueue(&f.path, "held");
        let message = f.engine.receive(1, Duration::ZERO).await.unwrap().remove(0);
        let token = message.lock_token.unwrap();

        let results = f
            .engine
            .receive_by_sequence_numbers(&[message.sequence_number])
            .await
            .unwrap();

        assert!(matches!(
            results[0],
            Err(ReceiverError::NotFound { sequence_number })
                if sequence_number == message.sequence_number
        ));
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.registry.lookup(token).unwrap().state(), LockState::Locked);
        let response = f
            .transport
            .send(BrokerRequest::Complete { lock_token: token }, OPERATION_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response, BrokerResponse::Settled);
    }

    /// Verify that a message locked by another receiver is reported as not found.
    #[tokio::test]
    async fn test_foreign_lock_is_not_found() {
        let f = fixture(ReceiveMode::PeekLock);
        let sequence_number = f.broker.enqueue(&f.path, "contested");
        let other = fixture_with(f.broker.clone(), ReceiveMode::PeekLock);
        other.engine.receive(1, Duration::ZERO).await.unwrap();

        let results = f
            .engine
            .receive_by_sequence_numbers(&[sequence_number])
            .await
            .unwrap();

        assert!(matches!(results[0], Err(ReceiverError::NotFound { .. })));
        assert!(f.registry.is_empty());
    }

    /// Verify that an empty request never reaches the broker.
    #[tokio::test]
    async fn test_empty_request() {
        let f = fixture(ReceiveMode::PeekLock);

        let results = f.engine.receive_by_sequence_numbers(&[]).await.unwrap();

        assert!(results.is_empty());
        assert_eq!(f.broker.request_count(RequestType::ReceiveBySequence), 0);
    }

    /// Verify that a request larger than the batch limit is rejected up front.
    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        let f = fixture(ReceiveMode::PeekLock);
        let sequence_numbers: Vec<SequenceNumber> = (1..=101).map(SequenceNumber::new).collect();

        let result = f.engine.receive_by_sequence_numbers(&sequence_numbers).await;

        assert!(matches!(
            result,
            Err(ReceiverError::Validation(ValidationError::OutOfRange { .. }))
        ));
        assert_eq!(f.broker.request_count(RequestType::ReceiveBySequence), 0);
    }
}

// ============================================================================
// Peek Tests
// ============================================================================

mod peek_tests {
    use super::*;

    /// Verify that peek continues from the cursor and never locks.
    #[tokio::test]
    async fn test_peek_advances_cursor() {
        let f = fixture(ReceiveMode::PeekLock);
        let sequence_numbers: Vec<SequenceNumber> = (0..5)
            .map(|i| f.broker.enqueue(&f.path, format!("message-{}", i)))
            .collect();
        assert_eq!(f.engine.last_peeked_sequence_number(), SequenceNumber::ZERO);

        let first = f.engine.peek(2, None).await.unwrap();
        let second = f.engine.peek(2, None).await.unwrap();

        assert_eq!(first[0].sequence_number, sequence_numbers[0]);
        assert_eq!(first[1].sequence_number, sequence_numbers[1]);
        assert_eq!(second[0].sequence_number, sequence_numbers[2]);
        assert_eq!(f.engine.last_peeked_sequence_number(), sequence_numbers[3]);
        assert!(f.registry.is_empty());

        // Peeked messages are still delivered normally, for the first time
        let received = f.engine.receive(5, Duration::ZERO).await.unwrap();
        assert_eq!(received.len(), 5);
        assert!(received.iter().all(|m| m.delivery_count == 1));
    }

    /// Verify that peeking from an explicit sequence number is repeatable.
    #[tokio::test]
    async fn test_peek_from_sequence_number_is_idempotent() {
        let f = fixture(ReceiveMode::PeekLock);
        let from = f.broker.enqueue(&f.path, "a");
        f.broker.enqueue(&f.path, "b");

        let first = f.engine.peek(10, Some(from)).await.unwrap();
        let second = f.engine.peek(10, Some(from)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    /// Verify that peek past the end returns nothing and keeps the cursor.
    #[tokio::test]
    async fn test_peek_past_end() {
        let f = fixture(ReceiveMode::PeekLock);
        let last = f.broker.enqueue(&f.path, "only");
        f.engine.peek(1, None).await.unwrap();

        let messages = f.engine.peek(1, None).await.unwrap();

        assert!(messages.is_empty());
        assert_eq!(f.engine.last_peeked_sequence_number(), last);
    }

    /// Verify that a broker that never answers produces a timeout.
    #[tokio::test(start_paused = true)]
    async fn test_peek_timeout() {
        let broker = InMemoryBroker::new(InMemoryConfig::default());
        let f = fixture_with(broker, ReceiveMode::PeekLock);
        f.broker.inject_fault(
            RequestType::Peek,
            InjectedFault::Delay(Duration::from_secs(60)),
        );

        let result = f.engine.peek(1, None).await;

        match result {
            Err(ReceiverError::Timeout {
                operation,
                duration,
            }) => {
                assert_eq!(operation, RequestType::Peek);
                assert_eq!(duration, OPERATION_TIMEOUT);
            }
            other => panic!("Expected Timeout, got: {:?}", other),
        }
        assert_eq!(f.engine.last_peeked_sequence_number(), SequenceNumber::ZERO);
    }
}
