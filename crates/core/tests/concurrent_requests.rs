//! End-to-end request/response correlation through the loop bridge.

use std::num::NonZeroUsize;
use std::time::Duration;

use futures::future::join_all;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use sessionmux::{
    connect_local, ClientError, Engine, EngineResponse, Envelope, LoopBridge, LoopMode,
    SessionId, SessionRegistry,
};
use testresult::TestResult;

/// Plays the viewer side: answers every method call, in shuffled order and a
/// few at a time.
#[derive(Default)]
struct ShufflingViewer {
    queued: Vec<EngineResponse>,
}

impl Engine for ShufflingViewer {
    fn handle_request(&mut self, session: SessionId, request: &[u8]) -> Vec<EngineResponse> {
        let Ok(Envelope::ViewerMethod { id: Some(id), data }) = Envelope::from_slice(request)
        else {
            return vec![];
        };
        let reply = Envelope::response(id, json!({ "method": data.method, "args": data.args }));
        self.queued
            .push(EngineResponse::new(session, reply.to_bytes().unwrap()));
        vec![]
    }

    fn poll(&mut self) -> Vec<EngineResponse> {
        let mut rng = rand::thread_rng();
        self.queued.shuffle(&mut rng);
        let keep = self.queued.len() / 2;
        self.queued.split_off(keep)
    }

    fn has_pending(&self) -> bool {
        !self.queued.is_empty()
    }
}

/// Never answers.
struct BlackHole;

impl Engine for BlackHole {
    fn handle_request(&mut self, _: SessionId, _: &[u8]) -> Vec<EngineResponse> {
        vec![]
    }

    fn poll(&mut self) -> Vec<EngineResponse> {
        vec![]
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn hundred_concurrent_requests_resolve_to_their_own_replies() -> TestResult {
    let registry = SessionRegistry::new();
    let bridge = LoopBridge::new(ShufflingViewer::default(), registry.clone()).with_mode(
        LoopMode::Pool {
            workers: NonZeroUsize::new(4).unwrap(),
        },
    );
    let handle = bridge.handle();
    let driver = tokio::spawn(bridge.run());

    let client = connect_local(&handle)?;
    let requests = (0..100u64)
        .map(|i| client.request("restore", vec![json!(i)]))
        .collect::<Result<Vec<_>, _>>()?;

    let replies = tokio::time::timeout(Duration::from_secs(10), join_all(requests)).await?;
    for (i, reply) in replies.into_iter().enumerate() {
        let reply = reply?;
        assert_eq!(reply, json!({ "method": "restore", "args": [i] }));
    }
    assert_eq!(client.pending_count(), 0);

    drop(client);
    // the session is released with the last client handle
    tokio::time::timeout(Duration::from_secs(1), async {
        while !registry.is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await?;

    handle.shutdown()?;
    driver.await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn terminate_releases_every_waiter() -> TestResult {
    let registry = SessionRegistry::new();
    let bridge = LoopBridge::new(BlackHole, registry);
    let handle = bridge.handle();
    tokio::spawn(bridge.run());

    let client = connect_local(&handle)?;
    let waiters: Vec<_> = (0..10)
        .map(|_| client.viewer_save())
        .collect::<Result<_, _>>()?;
    assert_eq!(client.pending_count(), 10);

    client.terminate();
    let results = tokio::time::timeout(Duration::from_secs(1), join_all(waiters)).await?;
    assert!(results
        .iter()
        .all(|res| matches!(res, Err(ClientError::Cancelled))));
    assert!(matches!(client.viewer_save(), Err(ClientError::Terminated)));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unanswered_request_times_out() -> TestResult {
    let bridge = LoopBridge::new(BlackHole, SessionRegistry::new());
    let handle = bridge.handle();
    tokio::spawn(bridge.run());

    let client = connect_local(&handle)?;
    let res: Result<Value, _> = client
        .viewer_save()?
        .with_timeout(Duration::from_millis(50))
        .await;
    assert_eq!(res, Err(ClientError::Timeout));
    assert_eq!(client.pending_count(), 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn requests_fail_loudly_once_the_loop_is_gone() -> TestResult {
    let bridge = LoopBridge::new(BlackHole, SessionRegistry::new());
    let handle = bridge.handle();
    let driver = tokio::spawn(bridge.run());
    handle.shutdown()?;
    driver.await?;

    let client = connect_local(&handle)?;
    let res = client.viewer_save()?.await;
    assert!(matches!(res, Err(ClientError::Send(_))), "{res:?}");
    Ok(())
}
