use std::time::Duration;

use proptest::prelude::*;
use write_lib::{
    ErrorCode, RequestType, ResponseKind, WriteError, WriteMessage, WriteResponse,
};

use crate::capability::FinishKind;
use crate::handler_chain::HandlerChain;
use crate::packet_writer::RequestOutcome;
use crate::test_support::*;
use crate::write_handler::{HandlerState, MessageOutcome};

fn data(request_id: u64, position: u64, payload: &[u8]) -> WriteMessage {
    WriteMessage::data(RequestType::Block, request_id, position, payload.to_vec())
}

fn eof(request_id: u64) -> WriteMessage {
    WriteMessage::end_of_stream(RequestType::Block, request_id)
}

fn flush(request_id: u64) -> WriteMessage {
    WriteMessage::flush(RequestType::Block, request_id)
}

fn open(h: &mut Harness, request_id: u64) {
    let outcome = h.handler.on_message(WriteMessage::open(request_id, descriptor()));
    assert_eq!(outcome, MessageOutcome::Started);
    assert_eq!(h.handler.state(), HandlerState::Active);
}

async fn next_response(h: &mut Harness) -> WriteResponse {
    tokio::time::timeout(Duration::from_secs(5), h.responses.recv())
        .await
        .expect("response in time")
        .expect("response channel open")
}

async fn join(h: &Harness) -> RequestOutcome {
    tokio::time::timeout(Duration::from_secs(5), h.handler.join())
        .await
        .expect("request finished in time")
        .expect("request exists")
}

fn failed_code(outcome: &RequestOutcome) -> ErrorCode {
    match outcome {
        RequestOutcome::Failed(err) => err.code(),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_contiguous_chunks_commit_once() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 1);
    assert_eq!(h.handler.on_message(data(1, 0, b"hello ")), MessageOutcome::Enqueued);
    assert_eq!(h.handler.on_message(data(1, 6, b"block ")), MessageOutcome::Enqueued);
    assert_eq!(h.handler.on_message(data(1, 12, b"world")), MessageOutcome::Enqueued);
    assert_eq!(h.handler.on_message(eof(1)), MessageOutcome::Enqueued);

    let outcome = join(&h).await;
    assert_eq!(outcome, RequestOutcome::Completed { bytes_written: 17 });
    assert_eq!(next_response(&mut h).await, WriteResponse::completed(1, 17));
    assert_eq!(h.handler.state(), HandlerState::Closed);

    assert_eq!(h.sink.written(), b"hello block world".to_vec());
    let calls = h.sink.calls();
    assert_eq!(calls.open, 1);
    assert_eq!(calls.commit, 1);
    assert_eq!(calls.close, 1);
    assert_eq!(calls.abort, 0);
    assert_eq!(calls.cleanup, 0);
    h.sink.with_state(|s| {
        assert_eq!(s.metric_bytes, 17);
        assert_eq!(s.finished, vec![(FinishKind::Completed, 17, s.total_reserved)]);
    });
}

#[tokio::test]
async fn test_gap_is_rejected_not_reordered() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 2);
    h.handler.on_message(data(2, 0, &[1u8; 10]));
    h.handler.on_message(data(2, 20, &[2u8; 10]));
    h.handler.on_message(data(2, 10, &[3u8; 10]));
    h.handler.on_message(eof(2));

    let outcome = join(&h).await;
    assert_eq!(
        outcome,
        RequestOutcome::Failed(WriteError::OutOfOrder {
            expected: 10,
            actual: 20
        })
    );
    let response = next_response(&mut h).await;
    assert_eq!(response.error_code(), Some(ErrorCode::OutOfOrderWrite));

    assert_eq!(h.sink.written(), vec![1u8; 10]);
    let calls = h.sink.calls();
    assert_eq!(calls.append, 1);
    assert_eq!(calls.commit, 0);
    assert_eq!(calls.abort, 1);
    assert_eq!(calls.cleanup, 1);
}

#[tokio::test]
async fn test_overlapping_chunk_is_rejected() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 3);
    h.handler.on_message(data(3, 0, &[0u8; 8]));
    h.handler.on_message(data(3, 4, &[0u8; 8]));

    let outcome = join(&h).await;
    assert_eq!(failed_code(&outcome), ErrorCode::OutOfOrderWrite);
    assert_eq!(h.sink.calls().commit, 0);
    assert_eq!(h.sink.calls().abort, 1);
}

#[tokio::test]
async fn test_channel_close_before_eof_closes_without_commit() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 4);
    h.handler.on_message(data(4, 0, &[7u8; 12]));
    h.handler.on_message(flush(4));
    assert_eq!(next_response(&mut h).await, WriteResponse::flushed(4, 12));

    h.handler.on_channel_closed();
    let outcome = join(&h).await;
    assert_eq!(outcome, RequestOutcome::Cancelled { bytes_written: 12 });

    let calls = h.sink.calls();
    assert_eq!(calls.close, 1);
    assert_eq!(calls.commit, 0);
    assert_eq!(calls.abort, 0);
    assert_eq!(calls.cleanup, 0);
    h.sink.with_state(|s| {
        assert_eq!(s.finished.len(), 1);
        assert_eq!(s.finished[0].0, FinishKind::Cancelled);
    });
    assert_eq!(h.handler.state(), HandlerState::Closed);
}

#[tokio::test]
async fn test_append_failure_aborts_and_stops() {
    let faults = Faults {
        fail_append_at: Some(1),
        ..Default::default()
    };
    let mut h = harness(RecordingSink::with_faults(16, faults), test_config());
    open(&mut h, 5);
    h.handler.on_message(data(5, 0, &[1u8; 8]));
    h.handler.on_message(data(5, 8, &[2u8; 8]));
    h.handler.on_message(data(5, 16, &[3u8; 8]));
    h.handler.on_message(eof(5));

    let outcome = join(&h).await;
    assert_eq!(failed_code(&outcome), ErrorCode::StorageFailure);
    assert_eq!(
        next_response(&mut h).await.error_code(),
        Some(ErrorCode::StorageFailure)
    );

    let calls = h.sink.calls();
    assert_eq!(calls.append, 2);
    assert_eq!(calls.abort, 1);
    assert_eq!(calls.cleanup, 1);
    assert_eq!(calls.commit, 0);
    assert_eq!(calls.close, 0);
    assert!(h.sink.with_state(|s| s.finished.is_empty()));
    assert_eq!(h.handler.buffered_bytes(), 0);
}

#[tokio::test]
async fn test_partial_append_is_fatal() {
    let faults = Faults {
        partial_append: true,
        ..Default::default()
    };
    let mut h = harness(RecordingSink::with_faults(16, faults), test_config());
    open(&mut h, 6);
    h.handler.on_message(data(6, 0, &[1u8; 10]));
    h.handler.on_message(eof(6));

    let outcome = join(&h).await;
    assert_eq!(failed_code(&outcome), ErrorCode::StorageFailure);
    assert_eq!(h.sink.calls().abort, 1);
    assert_eq!(h.sink.calls().commit, 0);
    assert_eq!(h.sink.with_state(|s| s.metric_bytes), 0);
}

#[tokio::test]
async fn test_reservation_failure_reports_capacity() {
    let faults = Faults {
        fail_reserve: true,
        ..Default::default()
    };
    let mut h = harness(RecordingSink::with_faults(16, faults), test_config());
    open(&mut h, 7);
    h.handler.on_message(data(7, 0, &[1u8; 4]));
    h.handler.on_message(eof(7));

    let outcome = join(&h).await;
    assert_eq!(failed_code(&outcome), ErrorCode::CapacityExhausted);
    let calls = h.sink.calls();
    assert_eq!(calls.reserve, 1);
    assert_eq!(calls.open, 0);
    assert_eq!(calls.cleanup, 1);
    assert_eq!(calls.abort, 0);
    assert_eq!(
        next_response(&mut h).await.error_code(),
        Some(ErrorCode::CapacityExhausted)
    );
}

#[tokio::test]
async fn test_commit_failure_falls_back_to_cleanup() {
    let faults = Faults {
        fail_commit: true,
        ..Default::default()
    };
    let mut h = harness(RecordingSink::with_faults(16, faults), test_config());
    open(&mut h, 8);
    h.handler.on_message(data(8, 0, &[1u8; 4]));
    h.handler.on_message(eof(8));

    let outcome = join(&h).await;
    assert_eq!(failed_code(&outcome), ErrorCode::StorageFailure);
    let calls = h.sink.calls();
    assert_eq!(calls.commit, 1);
    assert_eq!(calls.close, 0);
    assert_eq!(calls.abort, 1);
    assert_eq!(calls.cleanup, 1);
}

#[tokio::test]
async fn test_slow_sink_stalls_producer() {
    let faults = Faults {
        append_delay: Some(Duration::from_millis(10)),
        ..Default::default()
    };
    let config = test_config();
    let high = config.high_watermark_bytes;
    let low = config.low_watermark_bytes;
    let mut h = harness(RecordingSink::with_faults(16, faults), config);
    open(&mut h, 9);

    let mut stalls = 0;
    let mut expected = Vec::new();
    for i in 0..16u64 {
        if h.handler.is_reading_paused() {
            stalls += 1;
            assert!(h.handler.buffered_bytes() > low);
            tokio::time::timeout(Duration::from_secs(5), h.handler.wait_read_ready())
                .await
                .expect("reads resumed");
            assert!(h.handler.buffered_bytes() <= low);
        }
        // the producer never pushes while paused, so the overshoot is one chunk
        assert!(h.handler.buffered_bytes() <= high);
        let payload = vec![i as u8; 16];
        expected.extend_from_slice(&payload);
        assert_eq!(
            h.handler.on_message(data(9, i * 16, &payload)),
            MessageOutcome::Enqueued
        );
    }
    h.handler.on_message(eof(9));

    let outcome = join(&h).await;
    assert_eq!(outcome, RequestOutcome::Completed { bytes_written: 256 });
    assert!(stalls > 0);
    assert_eq!(h.sink.written(), expected);
}

#[tokio::test]
async fn test_terminal_action_runs_once() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 10);
    h.handler.on_message(data(10, 0, &[5u8; 5]));
    assert_eq!(h.handler.on_message(eof(10)), MessageOutcome::Enqueued);
    assert_eq!(h.handler.state(), HandlerState::Completing);
    assert_eq!(h.handler.on_message(eof(10)), MessageOutcome::Dropped);
    h.handler.on_error(WriteError::StorageIo("late".to_string()));
    assert_eq!(
        h.handler.on_message(WriteMessage::cancel(RequestType::Block, 10)),
        MessageOutcome::Dropped
    );

    let outcome = join(&h).await;
    assert_eq!(outcome, RequestOutcome::Completed { bytes_written: 5 });

    h.handler.on_channel_closed();
    h.handler.on_error(WriteError::StorageIo("after close".to_string()));
    assert_eq!(h.handler.on_message(eof(10)), MessageOutcome::Dropped);
    assert_eq!(h.handler.on_message(data(10, 5, b"x")), MessageOutcome::Dropped);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let calls = h.sink.calls();
    assert_eq!(calls.commit, 1);
    assert_eq!(calls.close, 1);
    assert_eq!(calls.abort, 0);
    assert_eq!(calls.cleanup, 0);
    assert_eq!(next_response(&mut h).await, WriteResponse::completed(10, 5));
    assert!(h.responses.try_recv().is_err());
}

#[tokio::test]
async fn test_zero_byte_request_creates_no_writer() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 11);
    h.handler.on_message(eof(11));

    let outcome = join(&h).await;
    assert_eq!(outcome, RequestOutcome::Completed { bytes_written: 0 });
    assert_eq!(h.sink.calls(), CallCounts::default());
    assert_eq!(next_response(&mut h).await, WriteResponse::completed(11, 0));
}

#[tokio::test]
async fn test_flush_reports_current_offset() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 12);
    h.handler.on_message(flush(12));
    assert_eq!(next_response(&mut h).await, WriteResponse::flushed(12, 0));
    assert_eq!(h.sink.calls().open, 0);

    h.handler.on_message(data(12, 0, &[1u8; 10]));
    h.handler.on_message(flush(12));
    assert_eq!(next_response(&mut h).await, WriteResponse::flushed(12, 10));
    assert_eq!(h.sink.calls().flush, 1);

    h.handler.on_message(eof(12));
    assert_eq!(next_response(&mut h).await, WriteResponse::completed(12, 10));
}

#[tokio::test]
async fn test_cancel_message_takes_cancel_path() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 13);
    h.handler.on_message(data(13, 0, &[1u8; 6]));
    h.handler.on_message(flush(13));
    next_response(&mut h).await;

    assert_eq!(
        h.handler.on_message(WriteMessage::cancel(RequestType::Block, 13)),
        MessageOutcome::Signalled
    );
    assert_eq!(h.handler.on_message(data(13, 6, b"late")), MessageOutcome::Dropped);

    let outcome = join(&h).await;
    assert_eq!(outcome, RequestOutcome::Cancelled { bytes_written: 6 });
    assert_eq!(
        next_response(&mut h).await.kind,
        ResponseKind::Cancelled { bytes_written: 6 }
    );
    let calls = h.sink.calls();
    assert_eq!(calls.close, 1);
    assert_eq!(calls.commit, 0);
}

#[tokio::test]
async fn test_channel_error_takes_cleanup_path() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 14);
    h.handler.on_message(data(14, 0, &[1u8; 6]));
    h.handler.on_message(flush(14));
    next_response(&mut h).await;

    h.handler
        .on_error(WriteError::Decode("bad frame".to_string()));
    assert_eq!(h.handler.state(), HandlerState::Erroring);
    let outcome = join(&h).await;
    assert_eq!(failed_code(&outcome), ErrorCode::ProtocolViolation);
    let calls = h.sink.calls();
    assert_eq!(calls.cleanup, 1);
    assert_eq!(calls.abort, 1);
    assert_eq!(calls.close, 0);
    assert_eq!(calls.commit, 0);
}

#[tokio::test]
async fn test_open_rejects_bad_descriptor() {
    let mut h = harness(RecordingSink::new(16), test_config());
    let mut bad = descriptor();
    bad.destination_path = "/blocks/a-component-that-is-too-long".to_string();
    assert_eq!(
        h.handler.on_message(WriteMessage::open(15, bad)),
        MessageOutcome::Rejected
    );
    assert_eq!(h.handler.state(), HandlerState::Idle);
    assert_eq!(
        next_response(&mut h).await.error_code(),
        Some(ErrorCode::ProtocolViolation)
    );
    assert_eq!(h.handler.on_message(data(15, 0, b"x")), MessageOutcome::Dropped);
    assert!(h.handler.join().await.is_none());

    let mut escape = descriptor();
    escape.destination_path = "/blocks/../etc".to_string();
    assert_eq!(
        h.handler.on_message(WriteMessage::open(16, escape)),
        MessageOutcome::Rejected
    );
}

#[tokio::test]
async fn test_oversized_chunk_fails_request() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 17);
    assert_eq!(
        h.handler.on_message(data(17, 0, &[0u8; 33])),
        MessageOutcome::Rejected
    );
    let outcome = join(&h).await;
    assert_eq!(failed_code(&outcome), ErrorCode::ProtocolViolation);
    assert_eq!(h.sink.calls().open, 0);
    assert_eq!(h.sink.calls().cleanup, 1);
}

#[tokio::test]
async fn test_declared_length_is_enforced() {
    let mut h = harness(RecordingSink::new(16), test_config());
    let desc = descriptor().with_declared_length(10);
    assert_eq!(
        h.handler.on_message(WriteMessage::open(18, desc)),
        MessageOutcome::Started
    );
    h.handler.on_message(data(18, 0, &[1u8; 6]));
    h.handler.on_message(eof(18));
    let outcome = join(&h).await;
    assert_eq!(failed_code(&outcome), ErrorCode::ProtocolViolation);
    assert_eq!(h.sink.calls().commit, 0);
    assert_eq!(h.sink.calls().abort, 1);

    let desc = descriptor().with_declared_length(4);
    h.handler.on_message(WriteMessage::open(19, desc));
    h.handler.on_message(data(19, 0, &[1u8; 6]));
    let outcome = join(&h).await;
    assert_eq!(failed_code(&outcome), ErrorCode::ProtocolViolation);
}

#[tokio::test]
async fn test_requests_are_sequential_per_channel() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 20);
    assert_eq!(
        h.handler.on_message(WriteMessage::open(20, descriptor())),
        MessageOutcome::Dropped
    );
    assert_eq!(
        h.handler.on_message(WriteMessage::open(21, descriptor())),
        MessageOutcome::Rejected
    );
    let rejected = next_response(&mut h).await;
    assert_eq!(rejected.request_id, 21);
    assert_eq!(rejected.error_code(), Some(ErrorCode::ProtocolViolation));

    h.handler.on_message(data(20, 0, b"abc"));
    h.handler.on_message(eof(20));
    assert!(join(&h).await.is_completed());

    // a finished request is never reopened
    assert_eq!(
        h.handler.on_message(WriteMessage::open(20, descriptor())),
        MessageOutcome::Dropped
    );
    open(&mut h, 22);
    h.handler.on_message(data(22, 0, b"defg"));
    h.handler.on_message(eof(22));
    assert_eq!(join(&h).await, RequestOutcome::Completed { bytes_written: 4 });
    assert_eq!(h.sink.calls().commit, 2);
}

#[tokio::test]
async fn test_older_finished_request_is_not_reopened() {
    let mut h = harness(RecordingSink::new(16), test_config());
    open(&mut h, 20);
    h.handler.on_message(data(20, 0, b"abc"));
    h.handler.on_message(eof(20));
    assert!(join(&h).await.is_completed());

    open(&mut h, 22);
    h.handler.on_message(eof(22));
    assert!(join(&h).await.is_completed());

    assert_eq!(
        h.handler.on_message(WriteMessage::open(20, descriptor())),
        MessageOutcome::Dropped
    );
    assert_eq!(
        h.handler.on_message(WriteMessage::open(22, descriptor())),
        MessageOutcome::Dropped
    );
    assert_eq!(h.handler.on_message(data(20, 0, b"xyz")), MessageOutcome::Dropped);
    assert_eq!(h.handler.state(), HandlerState::Closed);
    assert_eq!(h.sink.calls().commit, 1);
    assert_eq!(h.sink.calls().open, 1);
}

#[tokio::test]
async fn test_completion_watcher_waits_without_polling() {
    let mut h = harness(RecordingSink::new(16), test_config());
    assert!(h.handler.completion_watcher().is_none());
    open(&mut h, 23);
    let mut watcher = h.handler.completion_watcher().unwrap();
    assert_eq!(watcher.request_id(), 23);

    let err = watcher.wait(Duration::from_millis(20)).await.unwrap_err();
    assert!(matches!(err, WriteError::InvalidState(_)));
    assert!(watcher.outcome().is_none());

    h.handler.on_message(data(23, 0, b"done"));
    h.handler.on_message(eof(23));
    let outcome = watcher.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, RequestOutcome::Completed { bytes_written: 4 });
}

#[tokio::test]
async fn test_handler_chain_routes_by_type() {
    let mut block = harness(RecordingSink::new(16), test_config());
    let ufs = harness(
        RecordingSink::new(16).for_request_type(RequestType::UfsFile),
        test_config(),
    );
    let ufs_sink = ufs.sink.clone();

    let ufs_msg = WriteMessage::end_of_stream(RequestType::UfsFile, 1);
    assert!(!block.handler.accept_message(&ufs_msg));
    assert_eq!(block.handler.on_message(ufs_msg.clone()), MessageOutcome::Rejected);

    let mut chain = HandlerChain::new();
    chain.push(Box::new(ufs.handler));
    assert_eq!(chain.dispatch(data(1, 0, b"x")), Err(data(1, 0, b"x")));

    let mut desc = descriptor();
    desc.request_type = RequestType::UfsFile;
    assert_eq!(
        chain.dispatch(WriteMessage::open(1, desc)),
        Ok(MessageOutcome::Started)
    );
    assert_eq!(
        chain.dispatch(WriteMessage::data(RequestType::UfsFile, 1, 0, b"ufs".to_vec())),
        Ok(MessageOutcome::Enqueued)
    );
    assert_eq!(chain.dispatch(ufs_msg), Ok(MessageOutcome::Enqueued));
    let outcomes = chain.join_all().await;
    assert_eq!(outcomes, vec![RequestOutcome::Completed { bytes_written: 3 }]);
    assert_eq!(ufs_sink.written(), b"ufs".to_vec());
    assert!(!chain.is_reading_paused());

    open(&mut block, 2);
    block.handler.on_channel_closed();
    assert!(!join(&block).await.is_completed());
}

fn run_request(sizes: &[usize], swap_at: Option<usize>) -> (RequestOutcome, Vec<u8>, Recorded) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut h = harness(RecordingSink::new(16), test_config());
        open(&mut h, 1);

        let mut chunks = Vec::new();
        let mut position = 0u64;
        for (i, size) in sizes.iter().enumerate() {
            let payload = vec![(i % 251) as u8; *size];
            chunks.push((position, payload));
            position += *size as u64;
        }
        if let Some(i) = swap_at {
            chunks.swap(i, i + 1);
        }
        for (position, payload) in chunks.iter() {
            h.handler.on_message(data(1, *position, payload));
        }
        h.handler.on_message(eof(1));

        let outcome = join(&h).await;
        let written = h.sink.written();
        let recorded = h.sink.with_state(|s| Recorded {
            calls: s.calls.clone(),
            written: Vec::new(),
            reservations: s.reservations.clone(),
            total_reserved: s.total_reserved,
            reservation_violations: s.reservation_violations,
            metric_bytes: s.metric_bytes,
            finished: s.finished.clone(),
        });
        (outcome, written, recorded)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_reservation_covers_cursor(sizes in prop::collection::vec(1usize..=32, 1..12)) {
        let total: usize = sizes.iter().sum();
        let (outcome, written, recorded) = run_request(&sizes, None);
        prop_assert_eq!(outcome, RequestOutcome::Completed { bytes_written: total as u64 });
        prop_assert_eq!(written.len(), total);
        prop_assert_eq!(recorded.reservation_violations, 0);
        prop_assert!(recorded.total_reserved >= total as u64);
        prop_assert!(recorded.reservations.iter().all(|r| *r >= 16));
        prop_assert_eq!(recorded.metric_bytes, total as u64);
    }

    #[test]
    fn prop_non_contiguous_arrival_is_rejected(
        sizes in prop::collection::vec(1usize..=32, 2..10),
        pick in any::<prop::sample::Index>(),
    ) {
        let at = pick.index(sizes.len() - 1);
        let (outcome, written, recorded) = run_request(&sizes, Some(at));
        let prefix: usize = sizes[..at].iter().sum();
        let rejected = matches!(outcome, RequestOutcome::Failed(WriteError::OutOfOrder { .. }));
        prop_assert!(rejected);
        prop_assert_eq!(written.len(), prefix);
        prop_assert_eq!(recorded.calls.commit, 0);
        prop_assert_eq!(recorded.calls.abort, if prefix > 0 { 1 } else { 0 });
        prop_assert_eq!(recorded.calls.cleanup, 1);
    }
}
