//! End-to-end dispatch scenarios driven through the engine with scripted
//! connections.

#![allow(clippy::unwrap_used)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use reqwest::Method;
use segfetch::{
    Attempt, Command, Connection, DispatchError, DownloadOptions, DownloadRequest,
    DownloadResponse, Engine, FailureType, GroupId, GroupStatus, RequestGroup, ScriptedConnection,
    ScriptedConnector, TransferMode,
};
use tempfile::TempDir;
use url::Url;

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn response(status: u16, headers: &[(&str, &str)], at: &str) -> DownloadResponse {
    DownloadResponse::from_parts(status, headers.iter().copied(), url(at)).unwrap()
}

fn options(dir: &Path) -> Arc<DownloadOptions> {
    Arc::new(DownloadOptions::with_dir(dir))
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn single_queued(engine: &Engine) -> &Command {
    assert_eq!(engine.queue_len(), 1, "queue: {:?}", engine.queued().collect::<Vec<_>>());
    engine.queued().next().unwrap()
}

fn step_ok(engine: &mut Engine) -> bool {
    engine.step().unwrap().unwrap()
}

#[test]
fn test_sized_response_transfers_on_current_connection() {
    let dir = TempDir::new().unwrap();
    let target = "http://a.example/data.bin";
    let body = patterned(1024);
    let connection = ScriptedConnection::new("a.example", 80)
        .response(response(200, &[("content-length", "1024")], target))
        .body(body.clone());
    let connection_id = connection.id();
    let mut connector = ScriptedConnector::new();
    connector.add(connection);

    let mut engine = Engine::new(Box::new(connector));
    let id = engine.create_group(vec![url(target)], options(dir.path()));
    engine.start(id).unwrap();
    assert!(step_ok(&mut engine));
    assert!(step_ok(&mut engine));

    let Command::Transfer(transfer) = single_queued(&engine) else {
        panic!("expected one body transfer");
    };
    assert_eq!(transfer.connection_id(), connection_id);
    assert!(matches!(transfer.mode(), TransferMode::Download));
    let group = engine.group(id).unwrap();
    assert!(group.has_piece_storage());
    assert!(group.segment_manager().is_some());
    assert!(dir.path().join("data.bin").exists());

    let report = engine.run();
    assert_eq!(report.completed, vec![id]);
    assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), body);
}

#[test]
fn test_pipelined_response_starts_new_attempt() {
    let dir = TempDir::new().unwrap();
    let target = "http://a.example/data.bin";
    let body = patterned(2048);
    let first = ScriptedConnection::new("a.example", 80)
        .response(response(200, &[("content-length", "2048")], target));
    let first_log = first.log();
    let second = ScriptedConnection::new("a.example", 80)
        .response(response(
            206,
            &[("content-length", "2048"), ("content-range", "bytes 0-2047/2048")],
            target,
        ))
        .body(body.clone());
    let second_log = second.log();
    let mut connector = ScriptedConnector::new();
    connector.add(first);
    connector.add(second);
    let connects = connector.connect_log();

    let mut engine = Engine::new(Box::new(connector));
    let options = Arc::new(DownloadOptions {
        enable_pipelining: true,
        ..DownloadOptions::with_dir(dir.path())
    });
    let id = engine.create_group(vec![url(target)], options);
    engine.start(id).unwrap();
    step_ok(&mut engine);
    step_ok(&mut engine);

    assert!(matches!(single_queued(&engine), Command::Attempt(_)));
    assert!(engine.pool().is_empty());
    assert!(
        engine
            .group(id)
            .unwrap()
            .segment_manager()
            .unwrap()
            .has_unassigned_work()
    );

    let report = engine.run();
    assert_eq!(report.completed, vec![id]);
    assert_eq!(connects.borrow().len(), 2);
    assert_eq!(first_log.body_bytes_read(), 0);
    assert_eq!(first_log.sent_requests()[0].range_start(), None);
    assert_eq!(second_log.sent_requests()[0].range_start(), Some(0));
    assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), body);
}

#[test]
fn test_bodyless_redirect_pools_once_and_retries() {
    let dir = TempDir::new().unwrap();
    let origin = "http://a.example/file.bin";
    let mirror = "http://b.example/file.bin";
    let redirecting = ScriptedConnection::new("a.example", 80)
        .response(response(302, &[("location", mirror)], origin));
    let redirect_log = redirecting.log();
    let serving = ScriptedConnection::new("b.example", 80)
        .response(response(200, &[("content-length", "3")], mirror))
        .body(b"abc".to_vec());
    let mut connector = ScriptedConnector::new();
    connector.add(redirecting);
    connector.add(serving);

    let mut engine = Engine::new(Box::new(connector));
    let id = engine.create_group(vec![url(origin)], options(dir.path()));
    engine.start(id).unwrap();
    step_ok(&mut engine);
    step_ok(&mut engine);

    let Command::Attempt(attempt) = single_queued(&engine) else {
        panic!("expected a new attempt, not a body transfer");
    };
    assert_eq!(attempt.request().url().as_str(), mirror);
    assert_eq!(engine.pool().len(), 1);
    assert!(!engine.group(id).unwrap().context().is_initialized());

    engine.run();
    assert_eq!(redirect_log.sent_requests().len(), 1);
    assert_eq!(redirect_log.body_bytes_read(), 0);
    assert_eq!(fs::read(dir.path().join("file.bin")).unwrap(), b"abc");
}

#[test]
fn test_redirect_body_is_drained_before_reuse() {
    let dir = TempDir::new().unwrap();
    let origin = "http://a.example/old.bin";
    let moved = "http://a.example/new.bin";
    let connection = ScriptedConnection::new("a.example", 80)
        .response(response(
            301,
            &[("location", "/new.bin"), ("content-length", "6")],
            origin,
        ))
        .body(b"moved!".to_vec())
        .response(response(200, &[("content-length", "5")], moved))
        .body(b"hello".to_vec());
    let log = connection.log();
    let mut connector = ScriptedConnector::new();
    connector.add(connection);
    let connects = connector.connect_log();

    let mut engine = Engine::new(Box::new(connector));
    let id = engine.create_group(vec![url(origin)], options(dir.path()));
    engine.start(id).unwrap();
    step_ok(&mut engine);
    step_ok(&mut engine);

    let Command::Transfer(transfer) = single_queued(&engine) else {
        panic!("expected a drain");
    };
    assert!(matches!(transfer.mode(), TransferMode::Drain { .. }));
    assert!(engine.pool().is_empty());

    let report = engine.run();
    assert_eq!(report.completed, vec![id]);
    assert_eq!(connects.borrow().len(), 1);
    assert_eq!(log.sent_requests().len(), 2);
    assert_eq!(log.sent_requests()[1].url().as_str(), moved);
    assert_eq!(log.body_bytes_read(), 11);
    assert_eq!(fs::read(dir.path().join("new.bin")).unwrap(), b"hello");
    assert!(!dir.path().join("old.bin").exists());
}

#[test]
fn test_chunked_response_takes_unsegmented_path() {
    let dir = TempDir::new().unwrap();
    let target = "http://a.example/stream.txt";
    let mut connector = ScriptedConnector::new();
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(
                200,
                &[("transfer-encoding", "chunked"), ("content-length", "0")],
                target,
            ))
            .body(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n".to_vec()),
    );

    let mut engine = Engine::new(Box::new(connector));
    let id = engine.create_group(vec![url(target)], options(dir.path()));
    engine.start(id).unwrap();
    step_ok(&mut engine);
    step_ok(&mut engine);

    let Command::Transfer(transfer) = single_queued(&engine) else {
        panic!("expected one body transfer");
    };
    assert_eq!(transfer.decoder().map(|d| d.name()), Some("chunked"));
    assert!(transfer.segment().is_none());

    let report = engine.run();
    assert_eq!(report.completed, vec![id]);
    let group = engine.group(id).unwrap();
    assert_eq!(group.context().total_length(), 0);
    assert!(group.segment_manager().is_none());
    assert_eq!(fs::read(dir.path().join("stream.txt")).unwrap(), b"hello world");
}

#[test]
fn test_zero_length_response_takes_unsegmented_path() {
    let dir = TempDir::new().unwrap();
    let target = "http://a.example/empty.txt";
    let mut connector = ScriptedConnector::new();
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(200, &[("content-length", "0")], target)),
    );

    let mut engine = Engine::new(Box::new(connector));
    let id = engine.create_group(vec![url(target)], options(dir.path()));
    let report = engine.run();

    assert_eq!(report.completed, vec![id]);
    let group = engine.group(id).unwrap();
    assert_eq!(group.context().total_length(), 0);
    assert!(group.segment_manager().is_none());
    assert_eq!(fs::metadata(dir.path().join("empty.txt")).unwrap().len(), 0);
}

#[test]
fn test_unsupported_encoding_is_fatal() {
    let dir = TempDir::new().unwrap();
    let target = "http://a.example/odd.bin";
    let mut connector = ScriptedConnector::new();
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(200, &[("transfer-encoding", "unknown-xyz")], target))
            .body(b"garbage".to_vec()),
    );

    let mut engine = Engine::new(Box::new(connector));
    let id = engine.create_group(vec![url(target)], options(dir.path()));
    engine.start(id).unwrap();
    step_ok(&mut engine);
    let err = engine.step().unwrap().unwrap_err();

    assert!(matches!(err, DispatchError::UnsupportedEncoding { .. }));
    assert_eq!(engine.queue_len(), 0);
    assert!(!dir.path().join("odd.bin").exists());
    assert!(matches!(
        engine.group(id).unwrap().status(),
        GroupStatus::Failed {
            failure: FailureType::Permanent,
            ..
        }
    ));
}

#[test]
fn test_second_response_keeps_context() {
    let dir = TempDir::new().unwrap();
    let target = "http://a.example/data.bin";
    let body = patterned(2048);
    let mut connector = ScriptedConnector::new();
    connector.add(ScriptedConnection::new("a.example", 80).response(response(
        200,
        &[("content-length", "2048"), ("content-type", "application/x-first")],
        target,
    )));
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(
                206,
                &[
                    ("content-length", "2048"),
                    ("content-range", "bytes 0-2047/2048"),
                    ("content-type", "text/second"),
                    ("content-disposition", "attachment; filename=\"renamed.bin\""),
                ],
                target,
            ))
            .body(body.clone()),
    );

    let mut engine = Engine::new(Box::new(connector));
    let options = Arc::new(DownloadOptions {
        enable_pipelining: true,
        ..DownloadOptions::with_dir(dir.path())
    });
    let id = engine.create_group(vec![url(target)], options);
    let report = engine.run();

    assert_eq!(report.completed, vec![id]);
    let context = engine.group(id).unwrap().context();
    assert_eq!(context.filename(), Some("data.bin"));
    assert_eq!(context.content_type(), Some("application/x-first"));
    assert_eq!(context.total_length(), 2048);
    assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), body);
    assert!(!dir.path().join("renamed.bin").exists());
}

#[test]
fn test_duplicate_destination_fails_before_writing() {
    let dir = TempDir::new().unwrap();
    let first = "http://a.example/same.bin";
    let second = "http://b.example/same.bin";
    let mut connector = ScriptedConnector::new();
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(200, &[("content-length", "4")], first))
            .body(b"AAAA".to_vec()),
    );
    let second_connection = ScriptedConnection::new("b.example", 80)
        .response(response(200, &[("content-length", "4")], second))
        .body(b"BBBB".to_vec());
    let second_log = second_connection.log();
    connector.add(second_connection);

    let mut engine = Engine::new(Box::new(connector));
    let winner = engine.create_group(vec![url(first)], options(dir.path()));
    let loser = engine.create_group(vec![url(second)], options(dir.path()));
    let report = engine.run();

    assert_eq!(report.completed, vec![winner]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, loser);
    assert_eq!(report.failed[0].1, FailureType::Conflict);
    assert_eq!(second_log.body_bytes_read(), 0);
    assert_eq!(fs::read(dir.path().join("same.bin")).unwrap(), b"AAAA");
    assert!(!dir.path().join("same_1.bin").exists());
    assert!(engine.registry().is_empty());
}

#[test]
fn test_duplicate_across_engines_sharing_registry() {
    let dir = TempDir::new().unwrap();
    let target = "http://a.example/shared.bin";
    let registry = Arc::new(segfetch::DownloadRegistry::new());

    let mut first_connector = ScriptedConnector::new();
    first_connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(200, &[("content-length", "4")], target)),
    );
    let mut first = Engine::with_registry(Box::new(first_connector), Arc::clone(&registry));
    let first_id = first.create_group(vec![url(target)], options(dir.path()));
    first.start(first_id).unwrap();
    step_ok(&mut first);
    step_ok(&mut first);
    assert_eq!(registry.len(), 1);

    let mut second_connector = ScriptedConnector::new();
    second_connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(200, &[("content-length", "4")], target)),
    );
    let mut second = Engine::with_registry(Box::new(second_connector), Arc::clone(&registry));
    second.add_group(RequestGroup::new(
        GroupId(7),
        vec![url(target)],
        options(dir.path()),
    ));
    second.start(GroupId(7)).unwrap();
    step_ok(&mut second);
    let err = second.step().unwrap().unwrap_err();
    assert!(matches!(err, DispatchError::DuplicateDownload { .. }));
    assert_eq!(second.queue_len(), 0);
}

#[test]
fn test_head_requests_never_transfer_a_body() {
    for headers in [
        &[("content-length", "10")][..],
        &[("transfer-encoding", "chunked")][..],
    ] {
        let dir = TempDir::new().unwrap();
        let target = "http://a.example/head.bin";
        let connection =
            ScriptedConnection::new("a.example", 80).response(response(200, headers, target));
        let log = connection.log();
        let mut connector = ScriptedConnector::new();
        connector.add(connection);

        let mut engine = Engine::new(Box::new(connector));
        let id = engine.allocate_group_id();
        engine.add_group(
            RequestGroup::new(id, vec![url(target)], options(dir.path())).with_method(Method::HEAD),
        );
        engine.start(id).unwrap();
        step_ok(&mut engine);
        step_ok(&mut engine);

        assert_eq!(engine.queue_len(), 0, "headers: {headers:?}");
        assert_eq!(*engine.group(id).unwrap().status(), GroupStatus::Complete);
        assert_eq!(log.body_bytes_read(), 0);
        assert!(!dir.path().join("head.bin").exists());
    }
}

#[test]
fn test_interrupted_download_resumes_from_snapshot() {
    let dir = TempDir::new().unwrap();
    let target = "http://a.example/big.bin";
    let body = patterned(3000);
    let options = Arc::new(DownloadOptions {
        piece_length: 1024,
        ..DownloadOptions::with_dir(dir.path())
    });

    let mut connector = ScriptedConnector::new();
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(200, &[("content-length", "3000")], target))
            .body(body[..1500].to_vec()),
    );
    let mut engine = Engine::new(Box::new(connector));
    let id = engine.create_group(vec![url(target)], Arc::clone(&options));
    let report = engine.run();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, id);
    assert_eq!(report.failed[0].1, FailureType::Transient);
    assert!(dir.path().join("big.bin.segfetch").exists());

    let mut connector = ScriptedConnector::new();
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(200, &[("content-length", "3000")], target)),
    );
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(
                206,
                &[("content-length", "1500"), ("content-range", "bytes 1500-2999/3000")],
                target,
            ))
            .body(body[1500..].to_vec()),
    );
    let connects = connector.connect_log();
    let mut engine = Engine::new(Box::new(connector));
    let resumed = engine.create_group(vec![url(target)], options);
    let report = engine.run();

    assert_eq!(report.completed, vec![resumed]);
    assert_eq!(connects.borrow().len(), 2);
    assert_eq!(fs::read(dir.path().join("big.bin")).unwrap(), body);
    assert!(!dir.path().join("big.bin.segfetch").exists());
}

#[test]
fn test_enormous_content_length_fails_the_download() {
    let dir = TempDir::new().unwrap();
    let target = "http://a.example/huge.bin";
    let mut connector = ScriptedConnector::new();
    connector.add(ScriptedConnection::new("a.example", 80).response(response(
        200,
        &[("content-length", "18446744073709551615")],
        target,
    )));

    let mut engine = Engine::new(Box::new(connector));
    let id = engine.create_group(vec![url(target)], options(dir.path()));
    let report = engine.run();

    assert!(report.completed.is_empty());
    assert_eq!(report.failed.len(), 1);
    let (failed, failure, message) = &report.failed[0];
    assert_eq!(*failed, id);
    assert_eq!(*failure, FailureType::Permanent);
    assert!(message.contains("pieces"), "{message}");
    assert!(!dir.path().join("huge.bin").exists());
    assert!(engine.registry().is_empty());
}

#[test]
fn test_failed_initialization_can_be_retried() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    fs::write(&out, b"not a directory").unwrap();
    let target = "http://a.example/data.bin";
    let body = patterned(512);
    let mut connector = ScriptedConnector::new();
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(200, &[("content-length", "512")], target)),
    );
    connector.add(
        ScriptedConnection::new("a.example", 80)
            .response(response(200, &[("content-length", "512")], target))
            .body(body.clone()),
    );

    let mut engine = Engine::new(Box::new(connector));
    let id = engine.create_group(vec![url(target)], options(&out));
    let report = engine.run();
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].2.contains("IO error"), "{:?}", report.failed);
    let group = engine.group(id).unwrap();
    assert!(!group.context().is_initialized());
    assert!(!group.has_piece_storage());

    fs::remove_file(&out).unwrap();
    let cuid = engine.next_cuid();
    engine.enqueue(Command::Attempt(Attempt::new(
        cuid,
        id,
        DownloadRequest::get(target).unwrap(),
    )));
    let report = engine.run();

    assert_eq!(report.completed, vec![id]);
    assert!(report.failed.is_empty());
    assert_eq!(fs::read(out.join("data.bin")).unwrap(), body);
}
