mod helpers;

use authora::device_flow::{normalize_user_code, DeviceFlowError, VerifyError};
use authora::entities::device_code;
use authora::storage;
use authora::token::{LocalTokenProvider, TokenProvider};
use chrono::Utc;
use helpers::builders::{
    age_last_poll, device_flow, set_device_code_expiry, ClientBuilder, UserBuilder,
    TEST_JWT_SECRET,
};
use helpers::db::TestDb;
use sea_orm::EntityTrait;

#[tokio::test]
async fn happy_path_issue_authorize_exchange() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let user = UserBuilder::new("alice").create(conn).await;
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let authorization = flow.issue(&client.client_id, "read write").await.unwrap();
    assert!(authorization.device_code.len() >= 40);
    assert_eq!(authorization.expires_in, 1800);
    assert_eq!(authorization.interval, 5);
    assert!(authorization
        .verification_uri_complete
        .contains(&authorization.user_code));

    // Two polls before approval: both pending
    for _ in 0..2 {
        age_last_poll(conn, &authorization.device_code).await;
        let err = flow
            .exchange(&client.client_id, &authorization.device_code)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceFlowError::AuthorizationPending));
    }

    flow.authorize(&authorization.user_code, &user.id)
        .await
        .unwrap();

    age_last_poll(conn, &authorization.device_code).await;
    let grant = flow
        .exchange(&client.client_id, &authorization.device_code)
        .await
        .unwrap();
    assert_eq!(grant.token_type, "Bearer");
    assert_eq!(grant.scope, "read write");
    assert!(grant.expires_in > 0);

    // The signed credential is bound to the authorizing user and client
    let provider = LocalTokenProvider::new(TEST_JWT_SECRET.to_string());
    let validation = provider.validate(&grant.access_token).await.unwrap();
    assert!(validation.valid);
    assert_eq!(validation.user_id.as_deref(), Some(user.id.as_str()));
    assert_eq!(
        validation.client_id.as_deref(),
        Some(client.client_id.as_str())
    );

    // The record was persisted for listing and revocation
    let record = storage::get_access_token_by_token_string(conn, &grant.access_token)
        .await
        .unwrap()
        .expect("token row must exist");
    assert_eq!(record.user_id, user.id);
    assert_eq!(record.client_id, client.client_id);

    // A second exchange of the same device code fails
    age_last_poll(conn, &authorization.device_code).await;
    let err = flow
        .exchange(&client.client_id, &authorization.device_code)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceFlowError::InvalidGrant));
}

#[tokio::test]
async fn expired_code_answers_expired_token() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let authorization = flow.issue(&client.client_id, "read").await.unwrap();
    // 31 minutes pass
    set_device_code_expiry(
        conn,
        &authorization.device_code,
        Utc::now().timestamp() - 60,
    )
    .await;

    let err = flow
        .exchange(&client.client_id, &authorization.device_code)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceFlowError::ExpiredToken));

    // Authorizing an expired code fails too
    let err = flow
        .authorize(&authorization.user_code, "someone")
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Expired));
}

#[tokio::test]
async fn consumed_code_answers_invalid_grant_even_after_expiry() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let user = UserBuilder::new("carol").create(conn).await;
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let authorization = flow.issue(&client.client_id, "read").await.unwrap();
    flow.authorize(&authorization.user_code, &user.id)
        .await
        .unwrap();
    flow.exchange(&client.client_id, &authorization.device_code)
        .await
        .unwrap();

    set_device_code_expiry(
        conn,
        &authorization.device_code,
        Utc::now().timestamp() - 60,
    )
    .await;
    age_last_poll(conn, &authorization.device_code).await;

    let err = flow
        .exchange(&client.client_id, &authorization.device_code)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceFlowError::InvalidGrant));
}

#[tokio::test]
async fn decorated_user_codes_resolve_to_the_same_grant() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let authorization = flow.issue(&client.client_id, "read").await.unwrap();
    let bare = normalize_user_code(&authorization.user_code);

    for decorated in [
        bare.clone(),
        bare.to_lowercase(),
        authorization.user_code.clone(),
        format!("  {}  ", authorization.user_code.to_lowercase()),
        bare
            .chars()
            .flat_map(|c| [c, '_'])
            .collect::<String>(),
    ] {
        let row = flow.find_by_user_code(&decorated).await.unwrap();
        assert_eq!(row.device_code, authorization.device_code);
    }
}

#[tokio::test]
async fn fast_polling_answers_slow_down_and_bumps_interval() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let authorization = flow.issue(&client.client_id, "read").await.unwrap();

    // First poll: pending, and the poll time is recorded
    let err = flow
        .exchange(&client.client_id, &authorization.device_code)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceFlowError::AuthorizationPending));

    // Second poll 1s later (well within interval=5): slow down
    let err = flow
        .exchange(&client.client_id, &authorization.device_code)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceFlowError::SlowDown));

    // The bumped interval is persisted and state did not advance
    let row = storage::get_device_code(conn, &authorization.device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.interval, 10);
    assert_eq!(row.status, device_code::STATUS_PENDING);
    assert!(row.last_polled_at.is_some());
}

#[tokio::test]
async fn denied_code_answers_access_denied_and_is_terminal() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let user = UserBuilder::new("dave").create(conn).await;
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let authorization = flow.issue(&client.client_id, "read").await.unwrap();
    flow.deny(&authorization.user_code).await.unwrap();

    let err = flow
        .exchange(&client.client_id, &authorization.device_code)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceFlowError::AccessDenied));

    // No path out of denied
    let err = flow
        .authorize(&authorization.user_code, &user.id)
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::AlreadyUsed));
    let err = flow.deny(&authorization.user_code).await.unwrap_err();
    assert!(matches!(err, VerifyError::AlreadyUsed));

    let row = storage::get_device_code(conn, &authorization.device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, device_code::STATUS_DENIED);
    assert!(row.user_id.is_none());
}

#[tokio::test]
async fn unknown_and_inactive_clients_are_rejected() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let err = flow.issue("no-such-client", "read").await.unwrap_err();
    assert!(matches!(err, DeviceFlowError::InvalidClient));

    storage::set_client_active(conn, &client.client_id, false)
        .await
        .unwrap();
    let err = flow.issue(&client.client_id, "read").await.unwrap_err();
    assert!(matches!(err, DeviceFlowError::InvalidClient));
}

#[tokio::test]
async fn exchange_requires_the_issuing_client() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let user = UserBuilder::new("erin").create(conn).await;
    let issuing = ClientBuilder::new().named("Issuing").create(conn).await;
    let other = ClientBuilder::new().named("Other").create(conn).await;
    let flow = device_flow(conn);

    let authorization = flow.issue(&issuing.client_id, "read").await.unwrap();
    flow.authorize(&authorization.user_code, &user.id)
        .await
        .unwrap();

    let err = flow
        .exchange(&other.client_id, &authorization.device_code)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceFlowError::InvalidGrant));

    // The grant is still intact for the rightful client
    age_last_poll(conn, &authorization.device_code).await;
    flow.exchange(&issuing.client_id, &authorization.device_code)
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_device_code_answers_invalid_grant() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let err = flow
        .exchange(&client.client_id, "not-a-device-code")
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceFlowError::InvalidGrant));
}

#[tokio::test]
async fn concurrent_exchanges_yield_exactly_one_token() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let user = UserBuilder::new("frank").create(conn).await;
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let authorization = flow.issue(&client.client_id, "read").await.unwrap();
    flow.authorize(&authorization.user_code, &user.id)
        .await
        .unwrap();
    age_last_poll(conn, &authorization.device_code).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let flow = flow.clone();
        let client_id = client.client_id.clone();
        let device_code = authorization.device_code.clone();
        handles.push(tokio::spawn(async move {
            flow.exchange(&client_id, &device_code).await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(DeviceFlowError::InvalidGrant) | Err(DeviceFlowError::SlowDown) => {}
            Err(other) => panic!("unexpected exchange outcome: {other:?}"),
        }
    }
    assert_eq!(successes, 1, "exactly one concurrent exchange may win");

    let row = storage::get_device_code(conn, &authorization.device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, device_code::STATUS_CONSUMED);

    // Exactly one token row was written
    let tokens = authora::entities::AccessToken::find().all(conn).await.unwrap();
    assert_eq!(tokens.len(), 1);
}

#[tokio::test]
async fn expiry_sweep_marks_overdue_codes() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let stale = flow.issue(&client.client_id, "read").await.unwrap();
    let fresh = flow.issue(&client.client_id, "read").await.unwrap();
    set_device_code_expiry(conn, &stale.device_code, Utc::now().timestamp() - 1).await;

    let swept = storage::expire_overdue_device_codes(conn, Utc::now().timestamp())
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let stale_row = storage::get_device_code(conn, &stale.device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stale_row.status, device_code::STATUS_EXPIRED);

    let fresh_row = storage::get_device_code(conn, &fresh.device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh_row.status, device_code::STATUS_PENDING);
}
