/*
[INPUT]:  Token endpoint mock, local push server, TailManager
[OUTPUT]: Feed supervision verification (delivery, reconnect, failure, shutdown)
[POS]:    Integration test layer - end to end feed tails
[UPDATE]: When changing feed supervision or shutdown logic
*/

mod common;

use std::time::Duration;

use common::{PushServer, eventually, feed, tail_config, token_server};
use kucoin_ws_adapter::{Domain, WsService};
use kucoin_ws_tail::{FeedReport, FeedRuntimeStatus, TailManager};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TICKER: &str = "/market/ticker:BTC-USDT";
const MATCH: &str = "/market/match:ETH-USDT";

async fn wait_finished(manager: &TailManager, feed_id: &str) {
    let deadline = tokio::time::Instant::now() + common::WAIT;
    while manager.runtime_status(feed_id) != Some(FeedRuntimeStatus::Finished) {
        assert!(tokio::time::Instant::now() < deadline, "feed {feed_id} did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_feed_counts_pushed_messages() {
    let push = PushServer::spawn().await;
    let rest = token_server(&push.url()).await;

    let mut manager = TailManager::new();
    assert_ok!(
        manager
            .spawn_from_config(tail_config(vec![feed("spot", &[TICKER, MATCH], &rest.uri())]))
            .await
    );
    eventually("both topics subscribed", || {
        push.subscribe_count(TICKER) == 1 && push.subscribe_count(MATCH) == 1
    })
    .await;

    let stats = manager.stats("spot").expect("feed registered");
    push.publish(TICKER, json!({"price": "67000.1"}));
    push.publish(MATCH, json!({"price": "3500.2"}));
    eventually("two messages counted", || stats.messages() == 2).await;

    assert_eq!(manager.runtime_status("spot"), Some(FeedRuntimeStatus::Running));
    assert_ok!(manager.shutdown_and_wait().await);
    assert!(manager.runtime_status_snapshot().is_empty());
}

#[tokio::test]
async fn test_report_lists_feeds_in_id_order() {
    let push = PushServer::spawn().await;
    let rest = token_server(&push.url()).await;

    let mut manager = TailManager::new();
    assert_ok!(
        manager
            .spawn_from_config(tail_config(vec![
                feed("spot-b", &[TICKER], &rest.uri()),
                feed("spot-a", &[TICKER], &rest.uri()),
            ]))
            .await
    );
    eventually("both feeds subscribed", || push.subscribe_count(TICKER) == 2).await;

    push.publish(TICKER, json!({"price": "2"}));
    eventually("each feed counted the push", || {
        manager.report().iter().all(|feed| feed.messages == 1)
    })
    .await;

    let report = manager.report();
    assert_eq!(
        report,
        vec![
            FeedReport {
                feed_id: "spot-a".to_string(),
                status: FeedRuntimeStatus::Running,
                messages: 1,
                errors: 0,
                reconnects: 0,
            },
            FeedReport {
                feed_id: "spot-b".to_string(),
                status: FeedRuntimeStatus::Running,
                messages: 1,
                errors: 0,
                reconnects: 0,
            },
        ]
    );
    assert!(!manager.all_finished());

    assert_ok!(manager.stop_feed("spot-a").await);
    assert_eq!(manager.report().len(), 1);
    assert_ok!(manager.shutdown_and_wait().await);
    assert!(manager.all_finished());
}

#[tokio::test]
async fn test_feed_survives_dropped_connection() {
    let push = PushServer::spawn().await;
    let rest = token_server(&push.url()).await;

    let mut manager = TailManager::new();
    assert_ok!(
        manager
            .spawn_from_config(tail_config(vec![feed("spot", &[TICKER], &rest.uri())]))
            .await
    );
    eventually("subscribed", || push.subscribe_count(TICKER) == 1).await;

    push.drop_all();
    eventually("topic replayed on new connection", || {
        push.connections() == 2 && push.subscribe_count(TICKER) == 2
    })
    .await;

    let stats = manager.stats("spot").expect("feed registered");
    eventually("reconnect attempt counted", || stats.reconnects() >= 1).await;

    push.publish(TICKER, json!({"price": "1"}));
    eventually("message after reconnect", || stats.messages() == 1).await;
    assert_ok!(manager.shutdown_and_wait().await);
}

#[tokio::test]
async fn test_fatal_engine_failure_ends_feed_with_error() {
    let push = PushServer::spawn().await;
    let rest = token_server(&push.url()).await;

    let mut config = tail_config(vec![feed("spot", &[TICKER], &rest.uri())]);
    config.ws.reconnect = false;

    let mut manager = TailManager::new();
    assert_ok!(manager.spawn_from_config(config).await);
    eventually("subscribed", || push.subscribe_count(TICKER) == 1).await;

    push.drop_all();
    wait_finished(&manager, "spot").await;

    let err = assert_err!(manager.shutdown_and_wait().await);
    assert!(format!("{err:#}").contains("feed_id=spot"));
}

#[tokio::test]
async fn test_start_failure_is_reported() {
    let rest = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/bullet-public"))
        .respond_with(ResponseTemplate::new(500).set_body_string("maintenance"))
        .mount(&rest)
        .await;

    let mut config = tail_config(vec![feed("spot", &[TICKER], &rest.uri())]);
    config.ws.reconnect = false;

    let mut manager = TailManager::new();
    assert_ok!(manager.spawn_from_config(config).await);
    wait_finished(&manager, "spot").await;

    let err = assert_err!(manager.shutdown_and_wait().await);
    assert!(format!("{err:#}").contains("start engine"));
}

#[tokio::test]
async fn test_stop_feed_leaves_others_running() {
    let push = PushServer::spawn().await;
    let rest = token_server(&push.url()).await;

    let mut manager = TailManager::new();
    assert_ok!(
        manager
            .spawn_from_config(tail_config(vec![
                feed("tickers", &[TICKER], &rest.uri()),
                feed("matches", &[MATCH], &rest.uri()),
            ]))
            .await
    );
    eventually("both feeds subscribed", || {
        push.subscribe_count(TICKER) == 1 && push.subscribe_count(MATCH) == 1
    })
    .await;
    let matches = manager.stats("matches").expect("feed registered");

    assert_ok!(manager.stop_feed("tickers").await);
    assert_eq!(manager.runtime_status("tickers"), None);
    assert_eq!(manager.runtime_status("matches"), Some(FeedRuntimeStatus::Running));

    push.publish(MATCH, json!({"price": "3500"}));
    eventually("remaining feed still receives", || matches.messages() == 1).await;
    assert_ok!(manager.shutdown_and_wait().await);
}

#[tokio::test]
async fn test_duplicate_feed_id_rejected() {
    let mut manager = TailManager::new();
    let config = tail_config(vec![
        feed("spot", &[TICKER], "http://127.0.0.1:9"),
        feed("spot", &[MATCH], "http://127.0.0.1:9"),
    ]);
    let err = assert_err!(
        manager
            .spawn_from_config_with_engine_builder(config, |feed| {
                Ok(WsService::default()
                    .with_base_url(Domain::Spot, "http://127.0.0.1:9")
                    .engine(feed.feed)?)
            })
            .await
    );
    assert!(err.to_string().contains("duplicate feed id"));
    assert_eq!(manager.runtime_status_snapshot().len(), 1);
    let _ = manager.shutdown_and_wait().await;
}
