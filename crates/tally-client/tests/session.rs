use std::time::{Duration, Instant};

use tally_client::{unlock_feature, GateOutcome, LedgerClient, SessionPhase, TokenSession};
use tally_config::{Config, Grant, Server, Store};
use tally_contracts::CreditRequest;

async fn spawn_server() -> String {
    let cfg = Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        grant: Grant { initial_tokens: 60 },
    };
    let app = tally_server::build_app(cfg).await.expect("build app");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn quick_session(client: LedgerClient) -> TokenSession {
    // Short tween so tests can wait it out.
    TokenSession::new(client).with_tween_duration(Duration::from_millis(40))
}

#[tokio::test]
async fn sign_in_loads_the_granted_balance() {
    let base = spawn_server().await;
    let mut session = quick_session(LedgerClient::new(base.as_str()));

    session
        .set_owner(Some("user-1".to_string()))
        .await
        .expect("set owner");
    assert_eq!(session.phase(), SessionPhase::Ready);
    assert!(!session.is_loading());
    assert_eq!(session.balance(), Some(60));
}

#[tokio::test]
async fn use_tokens_debits_and_animates_toward_the_new_balance() {
    let base = spawn_server().await;
    let mut session = quick_session(LedgerClient::new(base.as_str()));
    session
        .set_owner(Some("user-1".to_string()))
        .await
        .expect("set owner");

    assert!(session.use_tokens(25, "addon_purchase").await);
    assert_eq!(session.balance(), Some(35));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(session.display_value(Instant::now()), 35.0);
}

#[tokio::test]
async fn insufficient_use_tokens_issues_no_debit() {
    let base = spawn_server().await;
    let client = LedgerClient::new(base.as_str());
    let mut session = quick_session(client.clone());
    session
        .set_owner(Some("user-1".to_string()))
        .await
        .expect("set owner");

    assert!(!session.use_tokens(75, "addon_purchase").await);
    assert_eq!(session.balance(), Some(60));

    let page = client.transactions("user-1").await.expect("transactions");
    // Only the provisioning credit; the refused spend never reached the wire.
    assert_eq!(page.transactions.len(), 1);
}

#[tokio::test]
async fn refresh_picks_up_out_of_band_credit() {
    let base = spawn_server().await;
    let client = LedgerClient::new(base.as_str());
    let mut session = quick_session(client.clone());
    session
        .set_owner(Some("user-1".to_string()))
        .await
        .expect("set owner");

    // A purchase completed through an external payment flow.
    let credited = client
        .credit(
            "user-1",
            &CreditRequest {
                amount: 40,
                description: "Purchased token pack".to_string(),
            },
        )
        .await
        .expect("credit");
    assert_eq!(credited.balance, 100);

    let refreshed = session.refresh().await.expect("refresh");
    assert_eq!(refreshed, 100);
    assert_eq!(session.balance(), Some(100));
}

#[tokio::test]
async fn gate_unlocks_then_upsells_once_tokens_run_out() {
    let base = spawn_server().await;
    let mut session = quick_session(LedgerClient::new(base.as_str()));
    session
        .set_owner(Some("user-1".to_string()))
        .await
        .expect("set owner");

    let first = unlock_feature(&mut session, 60, "voice_support").await;
    assert_eq!(first, GateOutcome::Unlocked { balance: 0 });

    let second = unlock_feature(&mut session, 60, "voice_support").await;
    assert_eq!(
        second,
        GateOutcome::Upsell {
            balance: 0,
            required: 60
        }
    );
}

#[tokio::test]
async fn switching_owner_resets_to_the_new_ledger() {
    let base = spawn_server().await;
    let mut session = quick_session(LedgerClient::new(base.as_str()));
    session
        .set_owner(Some("user-a".to_string()))
        .await
        .expect("set owner a");
    assert!(session.use_tokens(30, "addon_purchase").await);
    assert_eq!(session.balance(), Some(30));

    session
        .set_owner(Some("user-b".to_string()))
        .await
        .expect("set owner b");
    assert_eq!(session.balance(), Some(60));

    session.set_owner(None).await.expect("sign out");
    assert_eq!(session.phase(), SessionPhase::Uninitialized);
    assert_eq!(session.balance(), None);
}

#[tokio::test]
async fn unreachable_service_leaves_session_loading_and_debits_refused() {
    // Nothing listens here; sign-in fails and the session must not
    // pretend to be ready.
    let mut session = quick_session(LedgerClient::new("http://127.0.0.1:1"));

    let err = session.set_owner(Some("user-1".to_string())).await;
    assert!(err.is_err());
    assert!(session.is_loading());
    assert_eq!(session.balance(), None);
    assert!(!session.use_tokens(10, "addon_purchase").await);
}

#[tokio::test]
async fn reconcile_is_consistent_after_session_activity() {
    let base = spawn_server().await;
    let client = LedgerClient::new(base.as_str());
    let mut session = quick_session(client.clone());
    session
        .set_owner(Some("user-1".to_string()))
        .await
        .expect("set owner");
    assert!(session.use_tokens(13, "voice_support").await);

    let report = client.reconcile("user-1").await.expect("reconcile");
    assert!(report.consistent);
    assert_eq!(report.recorded_balance, 47);
    assert_eq!(report.drift, 0);
}
