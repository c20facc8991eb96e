//! Descriptor and option tests for the OakDB Rust SDK.

use std::time::Duration;

use oakdb::{
  ClusterOptions, CommandDescriptor, Error, Expiry, Failure, OperationKind, ServerCode,
  MAX_KEY_SIZE, RELATIVE_EXPIRY_CUTOFF,
};

#[test]
fn test_cluster_options_defaults() {
  let opts = ClusterOptions::default();
  assert_eq!(opts.operation_timeout, Duration::from_millis(2500));
  assert_eq!(opts.vbuckets, 1024);
}

#[test]
fn test_cluster_options_builder_chain() {
  let opts = ClusterOptions::default()
    .with_operation_timeout(Duration::from_secs(10))
    .with_vbuckets(64);
  assert_eq!(opts.operation_timeout, Duration::from_secs(10));
  assert_eq!(opts.vbuckets, 64);
}

#[test]
fn test_descriptor_accessors() {
  let d = CommandDescriptor::upsert("user::1", "{}")
    .cas(42)
    .expiry(Expiry::Relative(60))
    .format(0x2000)
    .build()
    .unwrap();
  assert_eq!(d.kind(), OperationKind::Upsert);
  assert_eq!(&d.key()[..], b"user::1");
  assert_eq!(&d.value().unwrap()[..], b"{}");
  assert_eq!(d.cas(), Some(42));
  assert_eq!(d.expiry(), Expiry::Relative(60));
  assert_eq!(d.format(), 0x2000);
}

#[test]
fn test_validation_is_synchronous() {
  // Construction failures never reach the asynchronous completion path.
  assert!(matches!(
    CommandDescriptor::fetch("").build(),
    Err(Error::InvalidArgument(_))
  ));
  assert!(matches!(
    CommandDescriptor::append("k", "").build(),
    Err(Error::InvalidArgument(_))
  ));
  assert!(matches!(
    CommandDescriptor::add("k", "v").cas(1).build(),
    Err(Error::InvalidArgument(_))
  ));
  assert!(matches!(
    CommandDescriptor::fetch(vec![b'k'; MAX_KEY_SIZE + 1]).build(),
    Err(Error::InvalidArgument(_))
  ));
  assert!(matches!(
    CommandDescriptor::upsert("k", "v")
      .expiry(Expiry::Absolute(1000))
      .build(),
    Err(Error::InvalidArgument(_))
  ));
}

#[test]
fn test_expiry_threshold() {
  assert_eq!(Expiry::from_raw(0), Expiry::None);
  assert_eq!(
    Expiry::from_raw(RELATIVE_EXPIRY_CUTOFF),
    Expiry::Relative(RELATIVE_EXPIRY_CUTOFF)
  );
  assert_eq!(
    Expiry::from_raw(1_700_000_000),
    Expiry::Absolute(1_700_000_000)
  );
  assert_eq!(Expiry::Relative(300).to_wire(), 300);
  assert_eq!(Expiry::None.to_wire(), 0);
}

#[test]
fn test_error_display() {
  let err = Error::InvalidArgument("routing key must not be empty".to_string());
  assert_eq!(
    format!("{}", err),
    "invalid argument: routing key must not be empty"
  );

  assert_eq!(format!("{}", Failure::Timeout), "operation timed out");
  assert_eq!(format!("{}", Failure::Cancelled), "operation cancelled");
  assert_eq!(
    format!("{}", Failure::RoutingUnavailable),
    "no live node for routing key"
  );
  assert_eq!(format!("{}", Failure::ConnectionLost), "connection lost");
}

#[test]
fn test_server_code_wire_round_trip() {
  for code in [
    ServerCode::KeyNotFound,
    ServerCode::KeyExists,
    ServerCode::ValueTooLarge,
    ServerCode::NotStored,
    ServerCode::CasMismatch,
    ServerCode::Internal,
  ] {
    assert_eq!(ServerCode::from_wire(code.to_wire()), code);
  }
  assert_eq!(ServerCode::from_wire(0x7777), ServerCode::Unknown(0x7777));
}
