use std::io::Write;

use basket_adapters::{
    load_order_fixture, FixtureConnector, SourceConnector, SourceCredentials, SourceError,
};

const FIXTURE: &str = r#"{
  "as_of": "2024-05-01",
  "transactions": [
    {"order_number": "112-0000001", "placed_date": "2024-04-30"},
    {"order_number": null, "placed_date": "2024-04-29"}
  ],
  "orders": [
    {
      "order_number": "112-0000001",
      "placed_date": "2024-04-30",
      "grand_total": "31.48",
      "subscription_discount": "1.66",
      "recipient": {"name": "Robin"},
      "items": [
        {"title": "Coffee Beans", "link": "/dp/B0000COFEE", "price": "15.74", "quantity": 2}
      ]
    }
  ]
}"#;

fn credentials() -> SourceCredentials {
    SourceCredentials {
        email: "robin@example.com".into(),
        password: "pw".into(),
        otp_secret: None,
    }
}

#[tokio::test]
async fn connector_builds_independent_sessions_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FIXTURE.as_bytes()).unwrap();
    let connector = FixtureConnector::new(file.path());

    let first = connector.connect(&credentials()).unwrap();
    let second = connector.connect(&credentials()).unwrap();

    first.login().await.unwrap();
    let transactions = first.list_transactions(5).await.unwrap();
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[1].order_number, None);

    let order = first.get_order("112-0000001").await.unwrap();
    assert_eq!(order.items[0].quantity, Some(2));
    assert_eq!(order.recipient.unwrap().name.as_deref(), Some("Robin"));

    // The second session never logged in.
    assert!(matches!(
        second.list_transactions(5).await,
        Err(SourceError::NotLoggedIn)
    ));
}

#[test]
fn missing_fixture_file_is_a_source_error() {
    let dir = tempfile::tempdir().unwrap();
    let connector = FixtureConnector::new(dir.path().join("absent.json"));
    assert!(matches!(
        connector.connect(&credentials()),
        Err(SourceError::Fixture(_))
    ));
}

#[tokio::test]
async fn bundled_sample_fixture_loads_and_pins_its_password() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures/orders.sample.json");
    let fixture = load_order_fixture(path).unwrap();
    assert_eq!(fixture.orders.len(), 3);
    assert_eq!(fixture.flaky_orders.get("113-2201554-0914610"), Some(&1));

    let connector = FixtureConnector::new(path);
    let wrong = connector.connect(&credentials()).unwrap();
    assert!(matches!(wrong.login().await, Err(SourceError::Login(_))));

    let session = connector
        .connect(&SourceCredentials {
            password: "demo-password".into(),
            ..credentials()
        })
        .unwrap();
    session.login().await.unwrap();
    assert_eq!(session.list_transactions(3).await.unwrap().len(), 3);
    assert!(session.get_order("113-2201554-0914610").await.is_err());
    assert!(session.get_order("113-2201554-0914610").await.is_ok());
}
