use camlink::ice::{ClientProfile, IceConfigResolver};
use camlink::invariant_ppt::contract_test;
use camlink::testing::{ExchangeScript, MockOfferExchange, MockTransportFactory};
use camlink::transport::ConnectivityState;
use camlink::{PeerSession, RetryPolicy, SessionOptions, SessionState};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn fast_opts() -> SessionOptions {
    SessionOptions {
        max_connect_attempts: 3,
        retry: RetryPolicy::new(20, 1_000),
        gathering_timeout: Duration::from_millis(200),
        exchange_timeout: Duration::from_millis(500),
    }
}

fn make_session(
    factory: Arc<MockTransportFactory>,
    exchange: Arc<MockOfferExchange>,
    opts: SessionOptions,
) -> PeerSession {
    let resolver = Arc::new(IceConfigResolver::new(None, ClientProfile::Desktop));
    PeerSession::new(
        "cam1",
        "https://streaming.example.dev/cam1/whep",
        opts,
        resolver,
        factory,
        exchange,
    )
}

async fn wait_for_state(session: &PeerSession, target: SessionState) {
    let mut rx = session.observe();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
        .await
        .expect("timed out waiting for state")
        .expect("state watch closed");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_first_attempt_success_state_sequence() {
    let factory = Arc::new(MockTransportFactory::new());
    let exchange = Arc::new(MockOfferExchange::always_succeed());
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), fast_opts());

    let mut rx = session.observe();
    let states = Arc::new(Mutex::new(vec![*rx.borrow()]));
    let recorded = Arc::clone(&states);
    let collector = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            recorded.lock().unwrap().push(*rx.borrow_and_update());
        }
    });

    session.connect().await.expect("first attempt should succeed");
    tokio::time::sleep(Duration::from_millis(20)).await;
    collector.abort();

    assert_eq!(
        *states.lock().unwrap(),
        vec![
            SessionState::Idle,
            SessionState::Negotiating,
            SessionState::GatheringCandidates,
            SessionState::AwaitingAnswer,
            SessionState::Connected,
        ]
    );
    assert_eq!(session.attempt().await, 0);
    assert_eq!(exchange.exchange_count(), 1);
    assert_eq!(factory.created_count(), 1);
    assert!(!factory.last().unwrap().applied_answers().is_empty());
}

#[tokio::test]
async fn test_server_errors_then_success_on_third_attempt() {
    let factory = Arc::new(MockTransportFactory::new());
    let exchange = Arc::new(MockOfferExchange::scripted(vec![
        ExchangeScript::FailStatus(500),
        ExchangeScript::FailStatus(500),
        ExchangeScript::Succeed,
    ]));
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), fast_opts());

    let started = Instant::now();
    session.connect().await.expect("third attempt should succeed");

    // Two intervening backoff waits: 20ms then 40ms.
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.attempt().await, 0);
    assert_eq!(exchange.exchange_count(), 3);

    // One fresh handle per attempt; every earlier handle was released.
    let created = factory.created();
    assert_eq!(created.len(), 3);
    assert!(created[0].is_closed());
    assert!(created[1].is_closed());
    assert!(!created[2].is_closed());

    contract_test(
        "session handles",
        &["Prior transport handle is released before a new one is created"],
    );
}

#[tokio::test]
async fn test_exhausted_budget_is_terminal_until_manual_retry() {
    let factory = Arc::new(MockTransportFactory::new());
    let exchange = Arc::new(MockOfferExchange::scripted(vec![
        ExchangeScript::FailStatus(502),
        ExchangeScript::FailStatus(502),
        ExchangeScript::FailStatus(502),
    ]));
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), fast_opts());

    let result = session.connect().await;
    assert!(matches!(
        result,
        Err(camlink::CamLinkError::RetriesExhausted(_))
    ));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(exchange.exchange_count(), 3);

    // No automatic attempts while Failed.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(exchange.exchange_count(), 3);
    assert_eq!(session.state(), SessionState::Failed);

    // The explicit retry resets the attempt budget; the script is exhausted
    // so the exchange now succeeds.
    session.connect().await.expect("manual retry should succeed");
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.attempt().await, 0);
    assert_eq!(exchange.exchange_count(), 4);
}

#[tokio::test]
async fn test_connect_is_noop_while_connected() {
    let factory = Arc::new(MockTransportFactory::new());
    let exchange = Arc::new(MockOfferExchange::always_succeed());
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), fast_opts());

    session.connect().await.unwrap();
    session.connect().await.unwrap();
    session.connect().await.unwrap();

    assert_eq!(exchange.exchange_count(), 1);
    assert_eq!(factory.created_count(), 1);
}

#[tokio::test]
async fn test_close_is_idempotent_and_terminal() {
    let factory = Arc::new(MockTransportFactory::new());
    let exchange = Arc::new(MockOfferExchange::always_succeed());
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), fast_opts());

    session.connect().await.unwrap();
    session.close().await;
    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(factory.last().unwrap().is_closed());
    assert!(matches!(
        session.connect().await,
        Err(camlink::CamLinkError::SessionClosed(_))
    ));
}

#[tokio::test]
async fn test_close_cancels_pending_reconnect() {
    let factory = Arc::new(MockTransportFactory::new());
    let exchange = Arc::new(MockOfferExchange::scripted(vec![
        ExchangeScript::FailStatus(500),
        ExchangeScript::FailStatus(500),
        ExchangeScript::FailStatus(500),
    ]));
    let opts = SessionOptions {
        retry: RetryPolicy::new(5_000, 10_000),
        ..fast_opts()
    };
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), opts);

    let driver = session.clone();
    let handle = tokio::spawn(async move { driver.connect().await });

    wait_for_state(&session, SessionState::Reconnecting).await;
    session.close().await;

    let result = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(camlink::CamLinkError::SessionClosed(_))
    ));
    assert_eq!(session.state(), SessionState::Closed);

    // The backoff was interrupted; no further attempt fires.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exchange.exchange_count(), 1);
}

#[tokio::test]
async fn test_offer_without_credentials_never_reaches_exchange() {
    let factory = Arc::new(MockTransportFactory::new().without_credentials());
    let exchange = Arc::new(MockOfferExchange::always_succeed());
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), fast_opts());

    let result = session.connect().await;
    assert!(matches!(
        result,
        Err(camlink::CamLinkError::RetriesExhausted(_))
    ));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(exchange.exchange_count(), 0);
}

#[tokio::test]
async fn test_answer_without_credentials_counts_as_attempt_failure() {
    let factory = Arc::new(MockTransportFactory::new());
    let exchange = Arc::new(MockOfferExchange::scripted(vec![
        ExchangeScript::AnswerWithoutCredentials,
        ExchangeScript::Succeed,
    ]));
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), fast_opts());

    session.connect().await.expect("second attempt should succeed");
    assert_eq!(exchange.exchange_count(), 2);
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_connectivity_loss_schedules_new_attempt() {
    let factory = Arc::new(MockTransportFactory::new());
    let exchange = Arc::new(MockOfferExchange::always_succeed());
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), fast_opts());

    session.connect().await.unwrap();
    let first = factory.last().unwrap();

    first.push_connectivity(ConnectivityState::Disconnected);

    let factory_probe = Arc::clone(&factory);
    wait_until(move || factory_probe.created_count() == 2).await;
    wait_for_state(&session, SessionState::Connected).await;

    assert!(first.is_closed());
    assert_eq!(exchange.exchange_count(), 2);
    assert_eq!(session.attempt().await, 0);
}

#[tokio::test]
async fn test_stuck_gathering_proceeds_after_timeout() {
    let factory = Arc::new(MockTransportFactory::new().with_stuck_gathering());
    let exchange = Arc::new(MockOfferExchange::always_succeed());
    let opts = SessionOptions {
        gathering_timeout: Duration::from_millis(40),
        ..fast_opts()
    };
    let session = make_session(Arc::clone(&factory), Arc::clone(&exchange), opts);

    let started = Instant::now();
    session.connect().await.expect("gathering timeout is not fatal");

    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(exchange.exchange_count(), 1);
}
