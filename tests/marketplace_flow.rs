use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

use stayd::tenant::TenantManager;
use stayd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("stayd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, "admin".into()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "stayd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

/// Connect as `user` to the given tenant. The login name is the principal.
async fn connect(addr: SocketAddr, tenant: &str, user: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(tenant)
        .user(user)
        .password("stayd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&tokio_postgres::SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn tenant_name() -> String {
    format!("t{}", Ulid::new())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn listing_lifecycle_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let tenant = tenant_name();

    let host = connect(addr, &tenant, "ada").await;
    let lid = Ulid::new();
    host.batch_execute(&format!(
        "INSERT INTO listings (id, title, city, price_per_night, bedrooms, max_guests) \
         VALUES ('{lid}', 'Seaside flat', 'Lisbon', 12000, 2, 4)"
    ))
    .await
    .unwrap();

    // Host profile was created and promoted
    let rows = host
        .simple_query("SELECT * FROM profiles WHERE role = 'host'")
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("principal"), Some("ada"));

    // Pending listing: hidden from anonymous search, addressable by id
    let anon = connect(addr, &tenant, "anonymous").await;
    let rows = anon.simple_query("SELECT * FROM listings").await.unwrap();
    assert!(data_rows(&rows).is_empty());

    let rows = anon
        .simple_query(&format!("SELECT * FROM listings WHERE id = '{lid}'"))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("pending"));

    // Moderator approves; listing appears in search with its host join
    let moderator = connect(addr, &tenant, "admin").await;
    moderator
        .batch_execute(&format!(
            "UPDATE listings SET status = 'approved' WHERE id = '{lid}'"
        ))
        .await
        .unwrap();

    let rows = anon
        .simple_query("SELECT * FROM listings WHERE city = 'lisbon'")
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("host_principal"), Some("ada"));
    assert_eq!(rows[0].get("status"), Some("approved"));
}

#[tokio::test]
async fn booking_and_availability_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let tenant = tenant_name();

    let host = connect(addr, &tenant, "ada").await;
    let lid = Ulid::new();
    host.batch_execute(&format!(
        "INSERT INTO listings (id, title, city, price_per_night, bedrooms, max_guests) \
         VALUES ('{lid}', 'Cabin', 'Oslo', 9000, 1, 2)"
    ))
    .await
    .unwrap();
    let moderator = connect(addr, &tenant, "admin").await;
    moderator
        .batch_execute(&format!(
            "UPDATE listings SET status = 'approved' WHERE id = '{lid}'"
        ))
        .await
        .unwrap();

    let guest = connect(addr, &tenant, "bo").await;

    // Available before any booking
    let rows = guest
        .simple_query(&format!(
            "SELECT * FROM availability WHERE listing_id = '{lid}' \
             AND start_date = '2024-06-01' AND end_date = '2024-06-08'"
        ))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows[0].get("available"), Some("t"));
    assert_eq!(rows[0].get("conflicting"), Some("0"));

    // Book it
    let bid = Ulid::new();
    guest
        .batch_execute(&format!(
            "INSERT INTO bookings (id, listing_id, start_date, end_date) \
             VALUES ('{bid}', '{lid}', '2024-06-01', '2024-06-08')"
        ))
        .await
        .unwrap();

    // Now blocked
    let rows = guest
        .simple_query(&format!(
            "SELECT * FROM availability WHERE listing_id = '{lid}' \
             AND start_date = '2024-06-05' AND end_date = '2024-06-10'"
        ))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows[0].get("available"), Some("f"));
    assert_eq!(rows[0].get("conflicting"), Some("1"));

    // Overlap from another guest is rejected with an exclusion violation
    let other = connect(addr, &tenant, "cam").await;
    let err = other
        .batch_execute(&format!(
            "INSERT INTO bookings (id, listing_id, start_date, end_date) \
             VALUES ('{}', '{lid}', '2024-06-05', '2024-06-12')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    let db = err.as_db_error().unwrap();
    assert!(db.message().contains("conflict"), "{db:?}");

    // Adjacent stay is fine
    other
        .batch_execute(&format!(
            "INSERT INTO bookings (id, listing_id, start_date, end_date) \
             VALUES ('{}', '{lid}', '2024-06-08', '2024-06-12')",
            Ulid::new()
        ))
        .await
        .unwrap();

    // Host confirms, guest's view shows the new status
    host.batch_execute(&format!(
        "UPDATE bookings SET status = 'confirmed' WHERE id = '{bid}'"
    ))
    .await
    .unwrap();
    let rows = guest.simple_query("SELECT * FROM bookings").await.unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("confirmed"));

    // DELETE cancels; the dates open up again
    guest
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{bid}'"))
        .await
        .unwrap();
    let rows = guest
        .simple_query(&format!(
            "SELECT * FROM availability WHERE listing_id = '{lid}' \
             AND start_date = '2024-06-01' AND end_date = '2024-06-08'"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows)[0].get("available"), Some("t"));
}

#[tokio::test]
async fn validation_and_authorization_errors_on_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let tenant = tenant_name();

    let host = connect(addr, &tenant, "ada").await;
    let lid = Ulid::new();
    host.batch_execute(&format!(
        "INSERT INTO listings (id, title, city, price_per_night, bedrooms, max_guests) \
         VALUES ('{lid}', 'Cabin', 'Oslo', 9000, 1, 2)"
    ))
    .await
    .unwrap();

    let guest = connect(addr, &tenant, "bo").await;

    // Malformed date
    let err = guest
        .simple_query(&format!(
            "SELECT * FROM availability WHERE listing_id = '{lid}' \
             AND start_date = 'not-a-date' AND end_date = '2024-06-08'"
        ))
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("YYYY-MM-DD"));

    // Missing dates
    let err = guest
        .simple_query(&format!(
            "SELECT * FROM availability WHERE listing_id = '{lid}'"
        ))
        .await
        .unwrap_err();
    assert!(err
        .as_db_error()
        .unwrap()
        .message()
        .contains("start_date and end_date"));

    // Inverted range
    let err = guest
        .batch_execute(&format!(
            "INSERT INTO bookings (id, listing_id, start_date, end_date) \
             VALUES ('{}', '{lid}', '2024-06-08', '2024-06-01')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("end_date"));

    // Anonymous mutation
    let anon = connect(addr, &tenant, "anonymous").await;
    let err = anon
        .batch_execute(&format!(
            "INSERT INTO bookings (id, listing_id, start_date, end_date) \
             VALUES ('{}', '{lid}', '2024-06-01', '2024-06-05')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "42501");

    // Unknown column in a filter is a parse error
    let err = anon
        .simple_query("SELECT * FROM listings WHERE pool = true")
        .await
        .unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code().code(), "42601");
}

#[tokio::test]
async fn booking_privacy_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let tenant = tenant_name();

    let host = connect(addr, &tenant, "ada").await;
    let lid = Ulid::new();
    host.batch_execute(&format!(
        "INSERT INTO listings (id, title, city, price_per_night, bedrooms, max_guests) \
         VALUES ('{lid}', 'Cabin', 'Oslo', 9000, 1, 2)"
    ))
    .await
    .unwrap();
    connect(addr, &tenant, "admin")
        .await
        .batch_execute(&format!(
            "UPDATE listings SET status = 'approved' WHERE id = '{lid}'"
        ))
        .await
        .unwrap();

    let guest = connect(addr, &tenant, "bo").await;
    guest
        .batch_execute(&format!(
            "INSERT INTO bookings (id, listing_id, start_date, end_date) \
             VALUES ('{}', '{lid}', '2024-06-01', '2024-06-05')",
            Ulid::new()
        ))
        .await
        .unwrap();

    // The other guest sees an empty set, not bo's booking
    let other = connect(addr, &tenant, "cam").await;
    let rows = other.simple_query("SELECT * FROM bookings").await.unwrap();
    assert!(data_rows(&rows).is_empty());

    // The host sees it through the listing
    let rows = host
        .simple_query(&format!(
            "SELECT * FROM bookings WHERE listing_id = '{lid}'"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows).len(), 1);
}

#[tokio::test]
async fn reviews_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let tenant = tenant_name();

    let host = connect(addr, &tenant, "ada").await;
    let lid = Ulid::new();
    host.batch_execute(&format!(
        "INSERT INTO listings (id, title, city, price_per_night, bedrooms, max_guests) \
         VALUES ('{lid}', 'Cabin', 'Oslo', 9000, 1, 2)"
    ))
    .await
    .unwrap();

    let guest = connect(addr, &tenant, "bo").await;
    guest
        .batch_execute(&format!(
            "INSERT INTO reviews (id, listing_id, rating, comment) \
             VALUES ('{}', '{lid}', 4, 'great spot')",
            Ulid::new()
        ))
        .await
        .unwrap();
    guest
        .batch_execute(&format!(
            "INSERT INTO reviews (id, listing_id, rating) VALUES ('{}', '{lid}', 5)",
            Ulid::new()
        ))
        .await
        .unwrap();

    let anon = connect(addr, &tenant, "anonymous").await;
    let rows = anon
        .simple_query(&format!("SELECT * FROM reviews WHERE listing_id = '{lid}'"))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows).len(), 2);

    // Average rating is joined onto the listing row
    let rows = anon
        .simple_query(&format!("SELECT * FROM listings WHERE id = '{lid}'"))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows)[0].get("rating"), Some("4.5"));

    // Rating bounds enforced
    let err = guest
        .batch_execute(&format!(
            "INSERT INTO reviews (id, listing_id, rating) VALUES ('{}', '{lid}', 9)",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("rating"));
}

#[tokio::test]
async fn tenants_are_isolated_over_the_wire() {
    let (addr, _tm) = start_test_server().await;
    let tenant_a = tenant_name();
    let tenant_b = tenant_name();

    let host_a = connect(addr, &tenant_a, "ada").await;
    let lid = Ulid::new();
    host_a
        .batch_execute(&format!(
            "INSERT INTO listings (id, title, city, price_per_night, bedrooms, max_guests) \
             VALUES ('{lid}', 'Cabin', 'Oslo', 9000, 1, 2)"
        ))
        .await
        .unwrap();

    // Same id in another tenant: not found
    let b = connect(addr, &tenant_b, "ada").await;
    let rows = b
        .simple_query(&format!("SELECT * FROM listings WHERE id = '{lid}'"))
        .await;
    assert!(rows.is_err());
}

#[tokio::test]
async fn listen_is_acknowledged() {
    let (addr, _tm) = start_test_server().await;
    let tenant = tenant_name();

    let client = connect(addr, &tenant, "ada").await;
    let lid = Ulid::new();
    client
        .batch_execute(&format!("LISTEN listing_{lid}"))
        .await
        .unwrap();
    client.batch_execute("UNLISTEN *").await.unwrap();

    // Garbage channels are rejected
    let err = client.batch_execute("LISTEN bookings_42").await.unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("channel"));
}
