use std::time::Duration;

use presence_types::domain::{SessionBeginResponse, SessionEndResponse};
use presence_types::frame::{ClientFrame, ServerFrame, TimestampMillis};
use presence_types::{ErrorCode, MomentId};

mod setup;

use setup::TestHarness;

fn bearer_header(token: &str) -> http::HeaderValue {
    http::HeaderValue::from_str(&format!("Bearer {token}")).expect("token is a valid header value")
}

#[tokio::test]
async fn s1_happy_path() -> eyre::Result<()> {
    let harness = TestHarness::start().await?;
    let moment_id = harness.insert_moment("live", 100).await;

    let begin: SessionBeginResponse = harness
        .server
        .post("/session/begin")
        .json(&serde_json::json!({ "moment_id": moment_id }))
        .await
        .json();
    assert_eq!(begin.moment_id, MomentId::from_uuid(moment_id));

    let mut ws = harness.server.get_websocket("/ws").await.into_websocket().await;
    let _pong: ServerFrame = ws.receive_json().await;

    ws.send_json(&ClientFrame::Join {
        session_token: begin.token.clone(),
        moment_id: begin.moment_id,
    })
    .await;
    let joined: ServerFrame = ws.receive_json().await;
    match joined {
        ServerFrame::Joined { presence_count, .. } => assert_eq!(presence_count, 1),
        other => panic!("expected Joined, got {other:?}"),
    }
    let update: ServerFrame = ws.receive_json().await;
    match update {
        ServerFrame::PresenceUpdate { count, peak_count, .. } => {
            assert_eq!(count, 1);
            assert_eq!(peak_count, 1);
        }
        other => panic!("expected PresenceUpdate, got {other:?}"),
    }

    ws.send_json(&ClientFrame::Heartbeat {
        session_token: begin.token.clone(),
        timestamp: TimestampMillis::now(),
    })
    .await;
    let pong: ServerFrame = ws.receive_json().await;
    assert!(matches!(pong, ServerFrame::Pong { .. }));

    drop(ws);

    let end: SessionEndResponse = harness
        .server
        .post("/session/end")
        .add_header(http::header::AUTHORIZATION, bearer_header(&begin.token))
        .await
        .json();
    assert_eq!(end.session_id, begin.session_id);

    Ok(())
}

#[tokio::test]
async fn s2_rate_limited_begin() -> eyre::Result<()> {
    let harness = TestHarness::start().await?;
    let moment_id = harness.insert_moment("live", 100).await;
    let body = serde_json::json!({ "moment_id": moment_id });

    for _ in 0..5 {
        let response = harness.server.post("/session/begin").json(&body).await;
        response.assert_status_ok();
    }

    let sixth = harness.server.post("/session/begin").json(&body).await;
    sixth.assert_status(http::StatusCode::TOO_MANY_REQUESTS);
    let retry_after = sixth
        .headers()
        .get(http::header::RETRY_AFTER)
        .expect("retry-after header present")
        .to_str()
        .unwrap()
        .to_owned();
    assert_eq!(retry_after, "300");

    Ok(())
}

#[tokio::test]
async fn s3_mismatched_moment_on_join() -> eyre::Result<()> {
    let harness = TestHarness::start().await?;
    let moment_1 = harness.insert_moment("live", 100).await;
    let moment_2 = harness.insert_moment("scheduled", 100).await;

    let begin: SessionBeginResponse = harness
        .server
        .post("/session/begin")
        .json(&serde_json::json!({ "moment_id": moment_1 }))
        .await
        .json();

    let mut ws = harness.server.get_websocket("/ws").await.into_websocket().await;
    let _pong: ServerFrame = ws.receive_json().await;

    ws.send_json(&ClientFrame::Join {
        session_token: begin.token,
        moment_id: MomentId::from_uuid(moment_2),
    })
    .await;
    let response: ServerFrame = ws.receive_json().await;
    match response {
        ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidToken),
        other => panic!("expected Error, got {other:?}"),
    }
    assert_eq!(harness.registry.presence_count(MomentId::from_uuid(moment_1)), 0);

    Ok(())
}

#[tokio::test]
async fn s4_heartbeat_timeout() -> eyre::Result<()> {
    let harness = TestHarness::start().await?;
    let moment_id = harness.insert_moment("live", 100).await;

    let begin: SessionBeginResponse = harness
        .server
        .post("/session/begin")
        .json(&serde_json::json!({ "moment_id": moment_id }))
        .await
        .json();

    let mut ws = harness.server.get_websocket("/ws").await.into_websocket().await;
    let _pong: ServerFrame = ws.receive_json().await;
    ws.send_json(&ClientFrame::Join {
        session_token: begin.token,
        moment_id: begin.moment_id,
    })
    .await;
    let _joined: ServerFrame = ws.receive_json().await;
    let _update: ServerFrame = ws.receive_json().await;

    assert_eq!(harness.registry.presence_count(begin.moment_id), 1);

    let reaped = harness
        .registry
        .sweep_timed_out(Duration::from_secs(0))
        .await;
    assert_eq!(reaped, 1);
    assert_eq!(harness.registry.presence_count(begin.moment_id), 0);

    Ok(())
}

#[tokio::test]
async fn s5_two_joiners_one_leaves() -> eyre::Result<()> {
    let harness = TestHarness::start().await?;
    let moment_id = harness.insert_moment("live", 100).await;

    let begin_1: SessionBeginResponse = harness
        .server
        .post("/session/begin")
        .json(&serde_json::json!({ "moment_id": moment_id }))
        .await
        .json();
    let begin_2: SessionBeginResponse = harness
        .server
        .post("/session/begin")
        .json(&serde_json::json!({ "moment_id": moment_id }))
        .await
        .json();

    let mut ws1 = harness.server.get_websocket("/ws").await.into_websocket().await;
    let _pong: ServerFrame = ws1.receive_json().await;
    ws1.send_json(&ClientFrame::Join {
        session_token: begin_1.token.clone(),
        moment_id: begin_1.moment_id,
    })
    .await;
    let _joined_1: ServerFrame = ws1.receive_json().await;
    let update_1: ServerFrame = ws1.receive_json().await;
    assert!(matches!(update_1, ServerFrame::PresenceUpdate { count: 1, .. }));

    let mut ws2 = harness.server.get_websocket("/ws").await.into_websocket().await;
    let _pong: ServerFrame = ws2.receive_json().await;
    ws2.send_json(&ClientFrame::Join {
        session_token: begin_2.token.clone(),
        moment_id: begin_2.moment_id,
    })
    .await;
    let _joined_2: ServerFrame = ws2.receive_json().await;

    let update_on_1: ServerFrame = ws1.receive_json().await;
    assert!(matches!(update_on_1, ServerFrame::PresenceUpdate { count: 2, .. }));
    let update_on_2: ServerFrame = ws2.receive_json().await;
    assert!(matches!(update_on_2, ServerFrame::PresenceUpdate { count: 2, .. }));

    ws1.send_json(&ClientFrame::Leave {
        session_token: begin_1.token,
    })
    .await;
    let _left: ServerFrame = ws1.receive_json().await;
    let update_after_leave: ServerFrame = ws2.receive_json().await;
    assert!(matches!(update_after_leave, ServerFrame::PresenceUpdate { count: 1, .. }));

    assert_eq!(harness.registry.presence_count(begin_2.moment_id), 1);

    Ok(())
}

#[tokio::test]
async fn s6_session_end_clears_presence() -> eyre::Result<()> {
    let harness = TestHarness::start().await?;
    let moment_id = harness.insert_moment("live", 100).await;

    let begin: SessionBeginResponse = harness
        .server
        .post("/session/begin")
        .json(&serde_json::json!({ "moment_id": moment_id }))
        .await
        .json();

    let mut ws = harness.server.get_websocket("/ws").await.into_websocket().await;
    let _pong: ServerFrame = ws.receive_json().await;
    ws.send_json(&ClientFrame::Join {
        session_token: begin.token.clone(),
        moment_id: begin.moment_id,
    })
    .await;
    let _joined: ServerFrame = ws.receive_json().await;
    let _update: ServerFrame = ws.receive_json().await;
    assert_eq!(harness.registry.presence_count(begin.moment_id), 1);

    harness
        .server
        .post("/session/end")
        .add_header(http::header::AUTHORIZATION, bearer_header(&begin.token))
        .await
        .assert_status_ok();

    assert_eq!(harness.registry.presence_count(begin.moment_id), 0);

    let again = harness
        .server
        .post("/session/end")
        .add_header(http::header::AUTHORIZATION, bearer_header(&begin.token))
        .await;
    again.assert_status(http::StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn session_begin_rejects_moment_not_live() -> eyre::Result<()> {
    let harness = TestHarness::start().await?;
    let moment_id = harness.insert_moment("scheduled", 100).await;

    let response = harness
        .server
        .post("/session/begin")
        .json(&serde_json::json!({ "moment_id": moment_id }))
        .await;
    response.assert_status(http::StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn session_end_without_authorization_header_is_unauthorized() -> eyre::Result<()> {
    let harness = TestHarness::start().await?;

    let response = harness.server.post("/session/end").await;
    response.assert_status(http::StatusCode::UNAUTHORIZED);

    Ok(())
}

#[tokio::test]
async fn moment_current_reports_live_presence_count() -> eyre::Result<()> {
    use presence_types::domain::MomentView;

    let harness = TestHarness::start().await?;
    let no_moment = harness.server.get("/moment/current").await;
    no_moment.assert_status(http::StatusCode::NOT_FOUND);

    let moment_id = harness.insert_moment("live", 100).await;
    let begin: SessionBeginResponse = harness
        .server
        .post("/session/begin")
        .json(&serde_json::json!({ "moment_id": moment_id }))
        .await
        .json();

    let mut ws = harness.server.get_websocket("/ws").await.into_websocket().await;
    let _pong: ServerFrame = ws.receive_json().await;
    ws.send_json(&ClientFrame::Join {
        session_token: begin.token,
        moment_id: begin.moment_id,
    })
    .await;
    let _joined: ServerFrame = ws.receive_json().await;
    let _update: ServerFrame = ws.receive_json().await;

    let view: MomentView = harness.server.get("/moment/current").await.json();
    assert_eq!(view.id, MomentId::from_uuid(moment_id));
    assert_eq!(view.presence_count, 1);

    Ok(())
}

#[tokio::test]
async fn health_reports_healthy_with_aggregate_stats() -> eyre::Result<()> {
    use presence_types::domain::HealthResponse;

    let harness = TestHarness::start().await?;
    harness.insert_moment("live", 100).await;
    harness
        .server
        .post("/session/begin")
        .json(&serde_json::json!({}))
        .await
        .assert_status_ok();

    let response = harness.server.get("/health").await;
    response.assert_status_ok();
    assert_eq!(
        response.headers().get(http::header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    let health: HealthResponse = response.json();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.stats.total_sessions, 1);

    Ok(())
}
