//! End-to-end transfers between two connected nodes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    assert_files_equal, connected_pair, connected_pair_with, create_test_file, random_bytes,
    test_config, wait_for_any, wait_for_task, wait_until, NODE_A, NODE_B,
};
use hubfile_core::config::FileConfig;
use hubfile_core::events::{FileEvent, OfferEvent};
use hubfile_core::protocol::{
    decode_frame, encode_ctrl, Action, Frame, SessionId, WriteReq, OP_OFFER,
};
use hubfile_core::transfer::FileService;
use hubfile_core::transport::{InboundFrame, Major, TransportEvent};
use hubfile_core::{Error, SUB_PROTO_FILE};
use tokio::sync::broadcast;

async fn next_offer(events: &mut broadcast::Receiver<FileEvent>) -> OfferEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(FileEvent::Offer(offer)) => return offer,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("Timed out waiting for offer event")
}

/// Smallest data frame offset `node` has sent.
fn first_data_offset(node: &common::Node) -> Option<u64> {
    node.transport
        .sent()
        .iter()
        .filter(|(route, _)| route.major == Major::Msg)
        .filter_map(|(_, payload)| match decode_frame(payload) {
            Ok(Frame::Data { header, .. }) => Some(header.offset),
            _ => None,
        })
        .min()
}

#[tokio::test]
async fn test_pull_end_to_end() {
    let (a, b) = connected_pair();
    let content = random_bytes(300 * 1024 + 7);
    let src = create_test_file(b.base_path(), "docs/report.bin", &content);

    let view = a
        .service
        .start_pull(NODE_B, "docs", "report.bin", "", "", true)
        .await
        .expect("start pull");
    assert_eq!(view.status, "waiting_response");
    assert_eq!(view.peer, NODE_B);

    let done = wait_for_task(&a.service, &view.task_id, |t| t.status == "completed").await;
    let dest = a.base_path().join("docs/report.bin");
    assert_eq!(done.done_bytes, content.len() as u64);
    assert_eq!(done.size, content.len() as u64);
    assert_eq!(done.sha256.len(), 64);
    assert_eq!(done.local_path, dest.display().to_string());
    assert_files_equal(&src, &dest);
    assert!(!a.base_path().join("docs/report.bin.part").exists());

    let upload = wait_for_any(&b.service, |t| {
        t.direction == "upload" && t.status == "completed"
    })
    .await;
    assert_eq!(upload.acked_bytes, content.len() as u64);
    assert_eq!(upload.consumer, NODE_A);

    wait_until(|| a.service.active_sessions() == 0 && b.service.active_sessions() == 0).await;
}

#[tokio::test]
async fn test_pull_small_file_without_hash() {
    let (a, b) = connected_pair();
    create_test_file(b.base_path(), "tiny.txt", b"0123456789");

    let view = a
        .service
        .start_pull(NODE_B, "", "tiny.txt", "saved", "copy.txt", false)
        .await
        .expect("start pull");
    let done = wait_for_task(&a.service, &view.task_id, |t| t.status == "completed").await;

    assert!(done.sha256.is_empty());
    assert_eq!(
        std::fs::read(a.base_path().join("saved/copy.txt")).expect("read"),
        b"0123456789"
    );
}

#[tokio::test]
async fn test_pull_empty_file() {
    let (a, b) = connected_pair();
    create_test_file(b.base_path(), "empty.txt", b"");

    let view = a
        .service
        .start_pull(NODE_B, "", "empty.txt", "", "", true)
        .await
        .expect("start pull");
    wait_for_task(&a.service, &view.task_id, |t| t.status == "completed").await;

    let meta = std::fs::metadata(a.base_path().join("empty.txt")).expect("stat");
    assert_eq!(meta.len(), 0);
    wait_for_any(&b.service, |t| t.direction == "upload" && t.status == "completed").await;
}

#[tokio::test]
async fn test_pull_missing_file_fails_with_code() {
    let (a, _b) = connected_pair();

    let view = a
        .service
        .start_pull(NODE_B, "", "nope.bin", "", "", true)
        .await
        .expect("start pull");
    let failed = wait_for_task(&a.service, &view.task_id, |t| t.status == "failed").await;
    assert_eq!(failed.last_error, "404 not found");
}

#[tokio::test]
async fn test_pull_rejects_unsafe_paths() {
    let (a, _b) = connected_pair();

    assert!(matches!(
        a.service.start_pull(NODE_B, "../etc", "passwd", "", "", true).await,
        Err(Error::InvalidDir(_))
    ));
    assert!(matches!(
        a.service.start_pull(NODE_B, "", "../passwd", "", "", true).await,
        Err(Error::InvalidName(_))
    ));
    assert!(matches!(
        a.service.start_pull(NODE_B, "", "f.txt", "/abs", "", true).await,
        Err(Error::InvalidDir(_))
    ));
    assert!(matches!(
        a.service.start_pull(0, "", "f.txt", "", "", true).await,
        Err(Error::MissingArgument(_))
    ));
    assert!(a.service.tasks_snapshot().is_empty());
}

#[tokio::test]
async fn test_pull_resumes_from_part_file() {
    let (a, b) = connected_pair();
    let content = random_bytes(100 * 1024);
    let src = create_test_file(b.base_path(), "big.bin", &content);
    create_test_file(a.base_path(), "big.bin.part", &content[..40_000]);

    let view = a
        .service
        .start_pull(NODE_B, "", "big.bin", "", "", true)
        .await
        .expect("start pull");
    wait_for_task(&a.service, &view.task_id, |t| t.status == "completed").await;

    assert_files_equal(&src, &a.base_path().join("big.bin"));
    assert_eq!(first_data_offset(&b), Some(40_000));
}

#[tokio::test]
async fn test_resume_with_corrupt_prefix_fails_integrity() {
    let (a, b) = connected_pair();
    let content = random_bytes(64 * 1024);
    create_test_file(b.base_path(), "data.bin", &content);
    create_test_file(a.base_path(), "data.bin.part", &vec![0xAA; 10_000]);

    let view = a
        .service
        .start_pull(NODE_B, "", "data.bin", "", "", true)
        .await
        .expect("start pull");
    let failed = wait_for_task(&a.service, &view.task_id, |t| t.status == "failed").await;

    assert_eq!(failed.last_error, "integrity failed");
    assert!(a.base_path().join("data.bin.part").exists());
    assert!(!a.base_path().join("data.bin").exists());
}

#[tokio::test]
async fn test_offer_confirmed_by_peer() {
    let (a, b) = connected_pair();
    let mut events = b.service.subscribe();
    let content = random_bytes(50 * 1024);
    let src = create_test_file(a.base_path(), "out/photo.jpg", &content);

    let view = a
        .service
        .start_offer(NODE_B, "out", "photo.jpg", true)
        .await
        .expect("start offer");
    assert_eq!(view.direction, "upload");

    let offer = next_offer(&mut events).await;
    assert_eq!(offer.provider, NODE_A);
    assert_eq!(offer.consumer, NODE_B);
    assert_eq!(offer.suggest_dir, "out");
    assert_eq!(offer.size, content.len() as u64);
    assert_eq!(offer.sha256.len(), 64);
    wait_for_any(&b.service, |t| t.status == "waiting_confirm").await;

    b.service
        .confirm_offer(&offer.session_id, true, "inbox")
        .await
        .expect("accept offer");

    wait_for_task(&a.service, &view.task_id, |t| t.status == "completed").await;
    let download = wait_for_any(&b.service, |t| t.status == "completed").await;
    assert_eq!(download.direction, "download");
    assert_eq!(download.local_dir, "inbox");
    assert_files_equal(&src, &b.base_path().join("inbox/photo.jpg"));
}

#[tokio::test]
async fn test_offer_auto_accepted() {
    let (a, b) = connected_pair_with(test_config, |base| FileConfig {
        auto_accept: true,
        ..test_config(base)
    });
    let src = create_test_file(a.base_path(), "notes/todo.txt", b"buy milk");

    let view = a
        .service
        .start_offer(NODE_B, "notes", "todo.txt", false)
        .await
        .expect("start offer");
    wait_for_task(&a.service, &view.task_id, |t| t.status == "completed").await;
    wait_for_any(&b.service, |t| t.status == "completed").await;

    assert_files_equal(&src, &b.base_path().join("notes/todo.txt"));
}

#[tokio::test]
async fn test_offer_rejected_by_peer() {
    let (a, b) = connected_pair();
    let mut events = b.service.subscribe();
    create_test_file(a.base_path(), "secret.txt", b"nope");

    let view = a
        .service
        .start_offer(NODE_B, "", "secret.txt", false)
        .await
        .expect("start offer");
    let offer = next_offer(&mut events).await;
    b.service
        .confirm_offer(&offer.session_id, false, "")
        .await
        .expect("reject offer");

    let rejected = wait_for_task(&a.service, &view.task_id, |t| t.status == "rejected").await;
    assert_eq!(rejected.last_error, "403 rejected");
    wait_for_any(&b.service, |t| t.status == "rejected").await;
    wait_until(|| a.service.active_sessions() == 0).await;
    assert!(!b.base_path().join("secret.txt").exists());

    assert!(matches!(
        b.service.confirm_offer(&offer.session_id, true, "").await,
        Err(Error::OfferNotFound(_))
    ));
}

#[tokio::test]
async fn test_offer_refused_when_file_exists_without_overwrite() {
    let (_a, b) = connected_pair_with(test_config, |base| FileConfig {
        auto_accept: true,
        ..test_config(base)
    });
    create_test_file(b.base_path(), "same.txt", b"old");

    // Offers built by `start_offer` always allow overwriting, so drive B
    // with a hand-made one that does not.
    let req = WriteReq {
        op: OP_OFFER.to_string(),
        target: NODE_B,
        session_id: SessionId::random().to_string(),
        name: "same.txt".to_string(),
        size: 3,
        overwrite: Some(false),
        ..WriteReq::default()
    };
    let payload = encode_ctrl(Action::Write, &req).expect("encode");
    b.service
        .handle_event(TransportEvent::Frame(InboundFrame {
            major: 1,
            sub_proto: SUB_PROTO_FILE,
            source_id: NODE_A,
            target_id: NODE_B,
            payload,
        }))
        .await;

    let failed = wait_for_any(&b.service, |t| t.status == "failed").await;
    assert_eq!(failed.last_error, "409 exists");
    assert_eq!(
        std::fs::read(b.base_path().join("same.txt")).expect("read"),
        b"old"
    );
}

#[tokio::test]
async fn test_offer_resume_adopts_complete_part() {
    let (a, b) = connected_pair_with(test_config, |base| FileConfig {
        auto_accept: true,
        ..test_config(base)
    });
    let content = random_bytes(20 * 1024);
    let src = create_test_file(a.base_path(), "done.bin", &content);
    create_test_file(b.base_path(), "done.bin.part", &content);

    let view = a
        .service
        .start_offer(NODE_B, "", "done.bin", true)
        .await
        .expect("start offer");
    let done = wait_for_task(&a.service, &view.task_id, |t| t.status == "completed").await;

    assert_eq!(done.acked_bytes, content.len() as u64);
    assert_eq!(first_data_offset(&a), None);
    assert_files_equal(&src, &b.base_path().join("done.bin"));
    assert!(!b.base_path().join("done.bin.part").exists());
}

#[tokio::test]
async fn test_admission_limit_returns_429() {
    let (a, b) = connected_pair_with(test_config, |base| FileConfig {
        max_concurrent: 1,
        ..test_config(base)
    });
    create_test_file(b.base_path(), "one.bin", &random_bytes(4096));
    create_test_file(b.base_path(), "two.bin", &random_bytes(4096));
    // Lost data keeps B's first send session open.
    b.transport.set_drop_data(true);

    let first = a
        .service
        .start_pull(NODE_B, "", "one.bin", "", "", false)
        .await
        .expect("first pull");
    wait_for_any(&b.service, |t| t.status == "waiting_ack").await;

    let second = a
        .service
        .start_pull(NODE_B, "", "two.bin", "", "", false)
        .await
        .expect("second pull");
    let failed = wait_for_task(&a.service, &second.task_id, |t| t.status == "failed").await;
    assert_eq!(failed.last_error, "429 too many sessions");

    let first = wait_for_task(&a.service, &first.task_id, |t| t.status == "receiving").await;
    assert_eq!(first.done_bytes, 0);
}

#[tokio::test]
async fn test_disconnect_fails_active_tasks() {
    let (a, b) = connected_pair();
    create_test_file(b.base_path(), "stuck.bin", &random_bytes(8192));
    b.transport.set_drop_data(true);

    let view = a
        .service
        .start_pull(NODE_B, "", "stuck.bin", "", "", false)
        .await
        .expect("start pull");
    wait_for_task(&a.service, &view.task_id, |t| t.status == "receiving").await;
    wait_for_any(&b.service, |t| t.status == "waiting_ack").await;
    assert_eq!(a.service.active_sessions(), 1);

    a.service
        .handle_event(TransportEvent::Disconnected("link lost".to_string()))
        .await;
    let failed = wait_for_task(&a.service, &view.task_id, |t| t.status == "failed").await;
    assert_eq!(failed.last_error, "link lost");
    assert_eq!(a.service.active_sessions(), 0);

    b.service.on_disconnect("").await;
    let upload = wait_for_any(&b.service, |t| t.direction == "upload").await;
    assert_eq!(upload.status, "failed");
    assert_eq!(upload.last_error, "connection closed");
    assert_eq!(b.service.active_sessions(), 0);
}

#[tokio::test]
async fn test_send_failure_fails_pull() {
    let (a, _b) = connected_pair();
    a.transport.set_down(true);

    let result = a
        .service
        .start_pull(NODE_B, "", "any.bin", "", "", false)
        .await;
    assert!(matches!(result, Err(Error::Transport(_))));

    let task = wait_for_any(&a.service, |t| t.status == "failed").await;
    assert_eq!(task.last_error, "send failed");
}

#[tokio::test]
async fn test_cancel_and_retry() {
    let (a, b) = connected_pair();
    let content = random_bytes(32 * 1024);
    let src = create_test_file(b.base_path(), "retry.bin", &content);
    b.transport.set_drop_data(true);

    let view = a
        .service
        .start_pull(NODE_B, "", "retry.bin", "", "", true)
        .await
        .expect("start pull");
    wait_for_task(&a.service, &view.task_id, |t| t.status == "receiving").await;

    a.service.cancel_task(&view.task_id).await.expect("cancel");
    let canceled = wait_for_task(&a.service, &view.task_id, |t| t.status == "canceled").await;
    assert_eq!(canceled.status, "canceled");
    assert_eq!(a.service.active_sessions(), 0);

    // Canceling again leaves the task alone.
    a.service.cancel_task(&view.task_id).await.expect("cancel again");
    assert!(matches!(
        a.service.cancel_task("missing").await,
        Err(Error::TaskNotFound(_))
    ));

    b.transport.set_drop_data(false);
    b.service.on_disconnect("reset").await;
    let retry = a.service.retry_task(&view.task_id).await.expect("retry");
    assert_ne!(retry.task_id, view.task_id);
    wait_for_task(&a.service, &retry.task_id, |t| t.status == "completed").await;
    assert_files_equal(&src, &a.base_path().join("retry.bin"));

    let old = a
        .service
        .tasks_snapshot()
        .into_iter()
        .find(|t| t.task_id == view.task_id)
        .expect("old task");
    assert_eq!(old.status, "canceled");
}

#[tokio::test]
async fn test_remote_list_and_read_text_events() {
    let (a, b) = connected_pair();
    let mut events = a.service.subscribe();
    create_test_file(b.base_path(), "docs/readme.md", b"# Title\nbody");
    std::fs::create_dir_all(b.base_path().join("docs/img")).expect("mkdir");

    a.service.list(NODE_B, "docs", false).await.expect("list");
    a.service
        .read_text(NODE_B, "docs", "readme.md", 7)
        .await
        .expect("read text");

    let (mut listed, mut text) = (None, None);
    tokio::time::timeout(Duration::from_secs(10), async {
        while listed.is_none() || text.is_none() {
            match events.recv().await.expect("event") {
                FileEvent::List(e) => listed = Some(e),
                FileEvent::Text(e) => text = Some(e),
                _ => {}
            }
        }
    })
    .await
    .expect("Timed out waiting for events");

    let listed = listed.expect("list event");
    assert_eq!(listed.node_id, NODE_B);
    assert_eq!(listed.code, 1);
    assert_eq!(listed.dirs, vec!["img"]);
    assert_eq!(listed.files, vec!["readme.md"]);

    let text = text.expect("text event");
    assert_eq!(text.code, 1);
    assert_eq!(text.text, "# Title");
    assert!(text.truncated);
    assert_eq!(text.size, 12);
}

#[tokio::test]
async fn test_local_list_answers_directly() {
    let (a, _b) = connected_pair();
    let mut events = a.service.subscribe();
    create_test_file(a.base_path(), "mine/a.txt", b"a");

    a.service.list(NODE_A, "mine", false).await.expect("list");
    match events.recv().await.expect("event") {
        FileEvent::List(e) => {
            assert_eq!(e.node_id, NODE_A);
            assert_eq!(e.files, vec!["a.txt"]);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert!(matches!(
        a.service.list(NODE_A, "absent", false).await,
        Err(Error::NotFound(_))
    ));
    match events.recv().await.expect("event") {
        FileEvent::List(e) => assert_eq!(e.code, 404),
        other => panic!("unexpected event: {other:?}"),
    }

    assert!(a.service.read_text(NODE_A, "mine", "a.txt", 0).await.is_ok());
}

#[tokio::test]
async fn test_operations_need_identity() {
    let (node, _rx) = common::solo_node(test_config);
    let fresh = FileService::new(Arc::clone(&node.transport), test_config(node.base_path()));

    assert!(matches!(
        fresh.start_pull(NODE_B, "", "f.txt", "", "", false).await,
        Err(Error::IdentityNotSet)
    ));
    assert!(matches!(
        fresh.start_offer(NODE_B, "", "f.txt", false).await,
        Err(Error::IdentityNotSet)
    ));
    assert!(fresh.tasks_snapshot().is_empty());
}
