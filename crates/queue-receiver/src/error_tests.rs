//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(ReceiverError::Timeout {
        operation: RequestType::Complete,
        duration: Duration::from_secs(1),
    }
    .is_transient());

    assert!(ReceiverError::Transport {
        operation: RequestType::Receive,
        message: "connection reset".to_string(),
    }
    .is_transient());

    assert!(!ReceiverError::LockLost {
        lock_token: LockToken::new(),
    }
    .is_transient());

    assert!(!ReceiverError::BrokerRejected {
        reason: "reason too long".to_string(),
    }
    .is_transient());

    assert!(!ReceiverError::NotFound {
        sequence_number: SequenceNumber::new(7),
    }
    .should_retry());
}

#[test]
fn test_retry_suggestions() {
    let timeout = ReceiverError::Timeout {
        operation: RequestType::RenewLock,
        duration: Duration::from_secs(30),
    };
    assert_eq!(timeout.retry_after(), Some(Duration::from_secs(1)));

    let lock_lost = ReceiverError::LockLost {
        lock_token: LockToken::new(),
    };
    assert_eq!(lock_lost.retry_after(), None);
    assert!(lock_lost.is_lock_lost());
}

#[test]
fn test_transport_error_mapping_keeps_operation() {
    let error = ReceiverError::from_transport(
        RequestType::Abandon,
        TransportError::Timeout {
            duration: Duration::from_millis(250),
        },
    );
    match error {
        ReceiverError::Timeout {
            operation,
            duration,
        } => {
            assert_eq!(operation, RequestType::Abandon);
            assert_eq!(duration, Duration::from_millis(250));
        }
        other => panic!("Expected Timeout, got: {:?}", other),
    }

    let error = ReceiverError::from_transport(
        RequestType::Peek,
        TransportError::ConnectionFailed {
            message: "link detached".to_string(),
        },
    );
    assert!(matches!(
        error,
        ReceiverError::Transport {
            operation: RequestType::Peek,
            ..
        }
    ));
    assert!(error.to_string().contains("link detached"));
}
