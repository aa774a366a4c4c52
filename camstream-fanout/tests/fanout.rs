use camstream_core::{CameraConfig, EncoderConfig, FanoutConfig, IdleState};
use camstream_fanout::{BranchId, Stream, StreamError, StreamManager};
use camstream_media::{BusEvent, GraphState, MemoryEngine, Operation, Sample};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn camera(id: &str) -> CameraConfig {
    CameraConfig {
        id: id.to_string(),
        name: format!("Camera {id}"),
        uri: Some("test://pattern".to_string()),
        ..Default::default()
    }
}

fn stream_with(engine: &Arc<MemoryEngine>, fanout: &FanoutConfig) -> Arc<Stream> {
    Stream::new(engine.clone(), &camera("cam-1"), &EncoderConfig::default(), fanout).unwrap()
}

fn stream(engine: &Arc<MemoryEngine>) -> Arc<Stream> {
    stream_with(engine, &FanoutConfig::default())
}

fn graph_state(engine: &MemoryEngine) -> Option<GraphState> {
    engine.graph_state(engine.graph_by_name("cam-1")?)
}

fn sample() -> Sample {
    Sample {
        data: bytes::Bytes::from_static(b"frame"),
        duration: Duration::from_millis(33),
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_graph_plays_while_any_branch_is_attached() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    assert_eq!(graph_state(&engine), Some(GraphState::Idle));

    let a = stream.attach().await.unwrap();
    let b = stream.attach().await.unwrap();
    let c = stream.attach().await.unwrap();
    assert_eq!(stream.branch_count(), 3);
    assert_eq!(graph_state(&engine), Some(GraphState::Playing));

    b.detach().await.unwrap();
    assert_eq!(graph_state(&engine), Some(GraphState::Playing));
    a.detach().await.unwrap();
    assert_eq!(graph_state(&engine), Some(GraphState::Playing));
    assert!(stream.is_playing());

    c.detach().await.unwrap();
    assert_eq!(graph_state(&engine), Some(GraphState::Paused));
    assert!(!stream.is_playing());
    assert_eq!(stream.branch_count(), 0);

    // and back up again
    let d = stream.attach().await.unwrap();
    assert_eq!(graph_state(&engine), Some(GraphState::Playing));
    d.detach().await.unwrap();
}

#[tokio::test]
async fn test_idle_state_is_configurable() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream_with(
        &engine,
        &FanoutConfig {
            idle_state: IdleState::Ready,
            ..Default::default()
        },
    );

    let a = stream.attach().await.unwrap();
    a.detach().await.unwrap();
    assert_eq!(graph_state(&engine), Some(GraphState::Ready));
}

#[tokio::test]
async fn test_removing_unknown_branch_is_not_found() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    let (branch_id, _track) = stream.create_branch().await.unwrap();

    let err = stream.remove_branch(BranchId::new(42)).await.unwrap_err();
    assert!(matches!(err, StreamError::BranchNotFound(id) if id == BranchId::new(42)));
    assert_eq!(stream.branch_count(), 1);

    stream.remove_branch(branch_id).await.unwrap();
    let err = stream.remove_branch(branch_id).await.unwrap_err();
    assert!(matches!(err, StreamError::BranchNotFound(_)));
    assert_eq!(stream.branch_count(), 0);
}

#[tokio::test]
async fn test_create_then_remove_releases_every_pad() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    let graph = engine.graph_by_name("cam-1").unwrap();
    let shared_elements = engine.graph_element_count(graph);

    let (branch_id, _track) = stream.create_branch().await.unwrap();
    assert_eq!(engine.graph_element_count(graph), shared_elements + 1);
    stream.remove_branch(branch_id).await.unwrap();

    assert_eq!(engine.pad_counts(), (2, 2));
    assert_eq!(engine.outstanding_request_pads(), 0);
    assert_eq!(engine.graph_element_count(graph), shared_elements);
}

#[tokio::test]
async fn test_failed_link_releases_acquired_pads() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    let graph = engine.graph_by_name("cam-1").unwrap();
    let shared_elements = engine.graph_element_count(graph);

    engine.fail_next(Operation::LinkPads);
    let err = stream.create_branch().await.unwrap_err();
    assert!(matches!(err, StreamError::Engine(_)));

    assert_eq!(engine.pad_counts(), (2, 2));
    assert_eq!(engine.graph_element_count(graph), shared_elements);
    assert_eq!(stream.branch_count(), 0);
    assert_eq!(graph_state(&engine), Some(GraphState::Idle));

    // the failed attempt consumed its id
    let (branch_id, _track) = stream.create_branch().await.unwrap();
    assert_eq!(branch_id, BranchId::new(1));
}

#[tokio::test]
async fn test_failed_pad_request_disposes_sink() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    let elements = engine.element_count();

    engine.fail_next(Operation::RequestPad);
    assert!(stream.create_branch().await.is_err());
    assert_eq!(engine.pad_counts(), (0, 0));
    assert_eq!(engine.element_count(), elements);
}

#[tokio::test]
async fn test_failed_first_play_rolls_back() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);

    engine.fail_next(Operation::SetGraphState);
    assert!(stream.create_branch().await.is_err());
    assert_eq!(engine.outstanding_request_pads(), 0);
    assert!(!stream.is_playing());
    // a half-applied play is undone
    assert_eq!(graph_state(&engine), Some(GraphState::Paused));

    let (branch_id, _track) = stream.create_branch().await.unwrap();
    assert_eq!(graph_state(&engine), Some(GraphState::Playing));
    stream.remove_branch(branch_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_never_interleave() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    engine.clear_calls();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.attach().await })
        })
        .collect();
    let mut attachments = Vec::new();
    for task in tasks {
        attachments.push(task.await.unwrap().unwrap());
    }

    let calls = engine.calls();
    let mut blocks: Vec<Vec<_>> = Vec::new();
    for call in calls {
        if call.op == Operation::CreateElement {
            blocks.push(Vec::new());
        }
        blocks
            .last_mut()
            .expect("log starts with element creation")
            .push(call);
    }
    assert_eq!(blocks.len(), 8);

    for (index, block) in blocks.iter().enumerate() {
        let ops: Vec<Operation> = block.iter().map(|c| c.op).collect();
        let state_op = if index == 0 {
            Operation::SetGraphState
        } else {
            Operation::SetElementState
        };
        assert_eq!(
            ops,
            vec![
                Operation::CreateElement,
                Operation::RequestPad,
                Operation::RequestPad,
                Operation::AddToGraph,
                Operation::LinkPads,
                Operation::LinkPads,
                state_op,
            ]
        );

        // every call in the block belongs to the same branch
        let branch = block[0]
            .target
            .rsplit('-')
            .next()
            .expect("sink name ends with the branch id")
            .to_string();
        assert!(block[2].target.ends_with(&format!("sink_{branch}")));
        assert!(block[5].target.contains(&format!("src_{branch}")));
    }

    for attachment in attachments {
        attachment.detach().await.unwrap();
    }
    assert_eq!(engine.outstanding_request_pads(), 0);
}

#[tokio::test]
async fn test_samples_reach_every_attached_branch() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    let graph = engine.graph_by_name("cam-1").unwrap();

    let a = stream.attach().await.unwrap();
    let b = stream.attach().await.unwrap();
    assert_eq!(engine.push_sample(graph, &sample()), 2);

    a.detach().await.unwrap();
    assert_eq!(engine.push_sample(graph, &sample()), 1);

    b.detach().await.unwrap();
    assert_eq!(engine.push_sample(graph, &sample()), 0);
}

#[tokio::test]
async fn test_dropped_attachment_is_detached() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);

    let attachment = stream.attach().await.unwrap();
    assert_eq!(attachment.branch_id(), BranchId::new(0));
    drop(attachment);

    let observed = Arc::clone(&stream);
    wait_for(move || observed.branch_count() == 0).await;
    wait_for(|| engine.outstanding_request_pads() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_detach_still_removes_branch() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);

    // keeps the topology lock busy so some detaches are cancelled while waiting on it
    let churn = {
        let stream = Arc::clone(&stream);
        tokio::spawn(async move {
            for _ in 0..50 {
                let attachment = stream.attach().await.unwrap();
                attachment.detach().await.unwrap();
            }
        })
    };

    let mut cancelled = Vec::new();
    for _ in 0..8 {
        let attachment = stream.attach().await.unwrap();
        cancelled.push(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = attachment.detach() => {}
                () = std::future::ready(()) => {}
            }
        }));
    }
    for task in cancelled {
        task.await.unwrap();
    }
    churn.await.unwrap();

    let observed = Arc::clone(&stream);
    wait_for(move || observed.branch_count() == 0).await;
    wait_for(|| engine.outstanding_request_pads() == 0).await;
    assert!(!stream.is_playing());
}

#[tokio::test]
async fn test_shutdown_destroys_graph() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    let _a = stream.create_branch().await.unwrap();
    let _b = stream.create_branch().await.unwrap();

    stream.shutdown().await;
    assert_eq!(engine.graph_count(), 0);
    assert_eq!(engine.element_count(), 0);
    assert_eq!(stream.branch_count(), 0);

    let err = stream.create_branch().await.unwrap_err();
    assert!(matches!(err, StreamError::ShutDown(_)));

    // idempotent
    stream.shutdown().await;
}

#[tokio::test]
async fn test_dropping_stream_frees_graph() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    drop(stream);
    assert_eq!(engine.graph_count(), 0);
    assert_eq!(engine.element_count(), 0);
}

#[tokio::test]
async fn test_failed_shared_chain_leaves_nothing_behind() {
    let engine = Arc::new(MemoryEngine::new());
    engine.fail_next(Operation::LinkElements);

    let result = Stream::new(
        engine.clone(),
        &camera("cam-1"),
        &EncoderConfig::default(),
        &FanoutConfig::default(),
    );
    assert!(result.is_err());
    assert_eq!(engine.graph_count(), 0);
    assert_eq!(engine.element_count(), 0);
}

#[tokio::test]
async fn test_bus_handler_sees_fatal_event() {
    let engine = Arc::new(MemoryEngine::new());
    let stream = stream(&engine);
    let graph = engine.graph_by_name("cam-1").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    stream.on_bus_event(move |id, event| {
        let _ = tx.send((id.to_string(), event.clone()));
    });

    engine.post_bus_event(graph, BusEvent::Latency);
    engine.post_bus_event(
        graph,
        BusEvent::Error {
            source: "cam-1-source".into(),
            message: "could not connect".into(),
            debug: Some("rtspsrc: 401 Unauthorized".into()),
        },
    );

    let (id, first) = rx.recv().await.unwrap();
    assert_eq!(id, "cam-1");
    assert_eq!(first, BusEvent::Latency);
    let (_, second) = rx.recv().await.unwrap();
    assert!(second.is_fatal());

    let observed = Arc::clone(&stream);
    wait_for(move || !observed.is_healthy()).await;
}

#[tokio::test]
async fn test_manager_rejects_duplicate_registration() {
    let engine = Arc::new(MemoryEngine::new());
    let manager = StreamManager::new(engine, EncoderConfig::default(), FanoutConfig::default());

    manager.register(&camera("b")).unwrap();
    manager.register(&camera("a")).unwrap();
    let err = manager.register(&camera("a")).unwrap_err();
    assert!(matches!(err, StreamError::AlreadyRegistered(_)));

    let ids: Vec<String> = manager.list().into_iter().map(|i| i.id.to_string()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manager_creates_stream_once_on_first_access() {
    let engine = Arc::new(MemoryEngine::new());
    let manager = Arc::new(StreamManager::new(
        engine.clone(),
        EncoderConfig::default(),
        FanoutConfig::default(),
    ));
    let lookups = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let lookups = Arc::clone(&lookups);
            tokio::spawn(async move {
                manager
                    .get_or_create("cam-9", |id| async move {
                        lookups.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(Some(camera(&id)))
                    })
                    .await
            })
        })
        .collect();

    let mut streams = Vec::new();
    for task in tasks {
        streams.push(task.await.unwrap().unwrap());
    }

    assert_eq!(lookups.load(Ordering::SeqCst), 1);
    assert!(streams.iter().all(|s| Arc::ptr_eq(s, &streams[0])));
    assert_eq!(engine.graph_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manager_retries_after_failed_lookup_without_conflict() {
    let engine = Arc::new(MemoryEngine::new());
    let manager = Arc::new(StreamManager::new(
        engine.clone(),
        EncoderConfig::default(),
        FanoutConfig::default(),
    ));
    let lookups = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(tokio::sync::Notify::new());
    let release = Arc::new(tokio::sync::Notify::new());
    let meet = Arc::new(tokio::sync::Barrier::new(2));

    let first = {
        let manager = Arc::clone(&manager);
        let (lookups, started, release) = (lookups.clone(), started.clone(), release.clone());
        tokio::spawn(async move {
            manager
                .get_or_create("cam-3", |_| async move {
                    lookups.fetch_add(1, Ordering::SeqCst);
                    started.notify_one();
                    release.notified().await;
                    Err(StreamError::Lookup("camera service unavailable".into()))
                })
                .await
        })
    };
    started.notified().await;

    let retry = |manager: Arc<StreamManager>, lookups: Arc<AtomicUsize>, meet: Arc<tokio::sync::Barrier>| {
        tokio::spawn(async move {
            manager
                .get_or_create("cam-3", |id| async move {
                    lookups.fetch_add(1, Ordering::SeqCst);
                    // two lookups running at once would both pass here together
                    let _ = tokio::time::timeout(Duration::from_millis(200), meet.wait()).await;
                    Ok(Some(camera(&id)))
                })
                .await
        })
    };

    let waiting = retry(manager.clone(), lookups.clone(), meet.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_one();
    assert!(matches!(first.await.unwrap(), Err(StreamError::Lookup(_))));

    let late = retry(manager.clone(), lookups.clone(), meet.clone());
    let waiting = waiting.await.unwrap().unwrap();
    let late = late.await.unwrap().unwrap();

    assert!(Arc::ptr_eq(&waiting, &late));
    assert_eq!(lookups.load(Ordering::SeqCst), 2);
    assert_eq!(engine.graph_count(), 1);
    assert_eq!(manager.pending_creations(), 0);
}

#[tokio::test]
async fn test_manager_bus_handler_covers_streams_created_on_first_access() {
    let engine = Arc::new(MemoryEngine::new());
    let manager = StreamManager::new(engine.clone(), EncoderConfig::default(), FanoutConfig::default());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    manager.on_bus_event(move |id, event| {
        let _ = tx.send((id.to_string(), event.clone()));
    });

    manager.register(&camera("static")).unwrap();
    manager
        .get_or_create("dynamic", |id| async move { Ok(Some(camera(&id))) })
        .await
        .unwrap();

    for id in ["static", "dynamic"] {
        let graph = engine.graph_by_name(id).unwrap();
        engine.post_bus_event(graph, BusEvent::EndOfStream);
        let (seen, event) = rx.recv().await.unwrap();
        assert_eq!(seen, id);
        assert_eq!(event, BusEvent::EndOfStream);
    }
}

#[tokio::test]
async fn test_manager_unknown_camera() {
    let engine = Arc::new(MemoryEngine::new());
    let manager = StreamManager::new(engine, EncoderConfig::default(), FanoutConfig::default());

    let err = manager
        .get_or_create("ghost", |_| async { Ok(None) })
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::StreamNotFound(_)));
    assert!(manager.is_empty());
    assert_eq!(manager.pending_creations(), 0);
}

#[tokio::test]
async fn test_manager_shutdown_releases_streams() {
    let engine = Arc::new(MemoryEngine::new());
    let manager = StreamManager::new(engine.clone(), EncoderConfig::default(), FanoutConfig::default());
    manager.register(&camera("a")).unwrap();
    manager.register(&camera("b")).unwrap();

    manager.remove("a").await.unwrap();
    assert_eq!(engine.graph_count(), 1);

    manager.shutdown().await;
    assert!(manager.is_empty());
    assert_eq!(engine.graph_count(), 0);
}
