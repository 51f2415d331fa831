mod helpers;

use authora::entities::device_code;
use authora::storage::{self, PaginationParams};
use chrono::Utc;
use helpers::builders::{device_flow, ClientBuilder, UserBuilder};
use helpers::db::TestDb;

#[tokio::test]
async fn authorize_cas_wins_once() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let user = UserBuilder::new("alice").create(conn).await;
    let other = UserBuilder::new("bob").create(conn).await;
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);

    let authorization = flow.issue(&client.client_id, "read").await.unwrap();
    let now = Utc::now().timestamp();

    assert!(
        storage::authorize_device_code(conn, &authorization.device_code, &user.id, now)
            .await
            .unwrap()
    );
    // Losing the race reports false and leaves the first binding in place
    assert!(
        !storage::authorize_device_code(conn, &authorization.device_code, &other.id, now)
            .await
            .unwrap()
    );
    // Deny cannot follow authorize
    assert!(
        !storage::deny_device_code(conn, &authorization.device_code, now)
            .await
            .unwrap()
    );

    let row = storage::get_device_code(conn, &authorization.device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, device_code::STATUS_AUTHORIZED);
    assert_eq!(row.user_id.as_deref(), Some(user.id.as_str()));
    assert!(row.authorized_at.is_some());
}

#[tokio::test]
async fn terminal_states_stay_terminal() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let user = UserBuilder::new("alice").create(conn).await;
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);
    let now = Utc::now().timestamp();

    let denied = flow.issue(&client.client_id, "read").await.unwrap();
    assert!(storage::deny_device_code(conn, &denied.device_code, now)
        .await
        .unwrap());
    assert!(
        !storage::authorize_device_code(conn, &denied.device_code, &user.id, now)
            .await
            .unwrap()
    );
    let row = storage::get_device_code(conn, &denied.device_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, device_code::STATUS_DENIED);

    // Expired codes accept neither transition
    let expired = flow.issue(&client.client_id, "read").await.unwrap();
    helpers::builders::set_device_code_expiry(conn, &expired.device_code, now - 10).await;
    assert!(
        !storage::authorize_device_code(conn, &expired.device_code, &user.id, now)
            .await
            .unwrap()
    );
    assert!(!storage::deny_device_code(conn, &expired.device_code, now)
        .await
        .unwrap());
}

#[tokio::test]
async fn user_code_is_reserved_only_while_unused() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let user = UserBuilder::new("alice").create(conn).await;
    let client = ClientBuilder::new().create(conn).await;
    let flow = device_flow(conn);
    let now = Utc::now().timestamp();

    let authorization = flow.issue(&client.client_id, "read").await.unwrap();
    let normalized = authora::device_flow::normalize_user_code(&authorization.user_code);

    assert!(storage::user_code_in_use(conn, &normalized, now)
        .await
        .unwrap());

    // Still reserved after authorization, released once consumed
    storage::authorize_device_code(conn, &authorization.device_code, &user.id, now)
        .await
        .unwrap();
    assert!(storage::user_code_in_use(conn, &normalized, now)
        .await
        .unwrap());

    storage::consume_device_code_issuing_token(
        conn,
        &authorization.device_code,
        storage::NewAccessToken {
            id: "tok-1".to_string(),
            token_string: "bearer-1".to_string(),
            user_id: user.id.clone(),
            client_id: client.client_id.clone(),
            scope: "read".to_string(),
            issued_at: now,
            expires_at: now + 3600,
        },
    )
    .await
    .unwrap()
    .expect("consume must win");

    assert!(!storage::user_code_in_use(conn, &normalized, now)
        .await
        .unwrap());
}

#[tokio::test]
async fn get_users_by_ids_returns_a_map() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let u1 = UserBuilder::new("user1").create(conn).await;
    let u2 = UserBuilder::new("user2").create(conn).await;
    let u3 = UserBuilder::new("user3").create(conn).await;

    let map = storage::get_users_by_ids(
        conn,
        &[u1.id.clone(), u2.id.clone(), u3.id.clone()],
    )
    .await
    .unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(map[&u1.id].username, "user1");
    assert_eq!(map[&u3.id].username, "user3");

    // Missing ids are simply absent
    let map = storage::get_users_by_ids(conn, &[u1.id.clone(), "missing".to_string()])
        .await
        .unwrap();
    assert_eq!(map.len(), 1);
    assert!(!map.contains_key("missing"));

    // Soft-deleted users are absent too
    storage::soft_delete_user(conn, &u2.id).await.unwrap();
    let map = storage::get_users_by_ids(conn, &[u1.id.clone(), u2.id.clone()])
        .await
        .unwrap();
    assert_eq!(map.len(), 1);

    // Empty input, empty map; duplicates collapse
    assert!(storage::get_users_by_ids(conn, &[]).await.unwrap().is_empty());
    let map = storage::get_users_by_ids(conn, &[u1.id.clone(), u1.id.clone()])
        .await
        .unwrap();
    assert_eq!(map.len(), 1);
}

#[tokio::test]
async fn client_listing_paginates_and_joins_creators() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let alice = UserBuilder::new("alice").create(conn).await;
    let bob = UserBuilder::new("bob").create(conn).await;

    ClientBuilder::new()
        .named("Client 1")
        .created_by(&alice.id)
        .create(conn)
        .await;
    ClientBuilder::new()
        .named("Client 2")
        .created_by(&bob.id)
        .create(conn)
        .await;
    ClientBuilder::new()
        .named("Client 3")
        .created_by(&alice.id)
        .create(conn)
        .await;
    ClientBuilder::new().named("Client 4").create(conn).await;

    let (clients, pagination) =
        storage::list_clients_with_creator(conn, &PaginationParams::new(1, 10, ""))
            .await
            .unwrap();
    assert_eq!(pagination.total, 4);
    assert_eq!(clients.len(), 4);

    let by_name: std::collections::HashMap<_, _> = clients
        .iter()
        .map(|c| (c.client.name.as_str(), c.creator_username.as_deref()))
        .collect();
    assert_eq!(by_name["Client 1"], Some("alice"));
    assert_eq!(by_name["Client 2"], Some("bob"));
    assert_eq!(by_name["Client 3"], Some("alice"));
    assert_eq!(by_name["Client 4"], None);

    // Page size splits the listing
    let (page, pagination) =
        storage::list_clients_with_creator(conn, &PaginationParams::new(1, 2, ""))
            .await
            .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(pagination.total_pages, 2);
    assert!(pagination.has_next);

    // Search narrows it
    let (found, pagination) =
        storage::list_clients_with_creator(conn, &PaginationParams::new(1, 10, "Client 1"))
            .await
            .unwrap();
    assert_eq!(pagination.total, 1);
    assert_eq!(found[0].client.name, "Client 1");

    let (none, pagination) =
        storage::list_clients_with_creator(conn, &PaginationParams::new(1, 10, "NonExistent"))
            .await
            .unwrap();
    assert!(none.is_empty());
    assert_eq!(pagination.total, 0);
}

#[tokio::test]
async fn deleted_creator_shows_no_name() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let doomed = UserBuilder::new("to-be-deleted").create(conn).await;
    ClientBuilder::new()
        .named("Orphaned")
        .created_by(&doomed.id)
        .create(conn)
        .await;

    storage::soft_delete_user(conn, &doomed.id).await.unwrap();

    let (clients, _) =
        storage::list_clients_with_creator(conn, &PaginationParams::new(1, 10, "Orphaned"))
            .await
            .unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].creator_username, None);
}

#[tokio::test]
async fn session_lifecycle() {
    let db = TestDb::new().await;
    let conn = db.connection();
    let user = UserBuilder::new("alice").create(conn).await;

    let session = storage::create_session(conn, &user.id, Some("fp".to_string()))
        .await
        .unwrap();
    let fetched = storage::get_session(conn, &session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.user_id, user.id);
    assert_eq!(fetched.fingerprint.as_deref(), Some("fp"));

    let later = fetched.last_activity + 100;
    storage::touch_session(conn, &session.session_id, later)
        .await
        .unwrap();
    let touched = storage::get_session(conn, &session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(touched.last_activity, later);

    // Idle sweep removes sessions past the timeout only
    let removed = storage::cleanup_idle_sessions(conn, 3600, later + 10_000)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(storage::get_session(conn, &session.session_id)
        .await
        .unwrap()
        .is_none());
}
