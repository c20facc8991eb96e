//! Command descriptors: the immutable per-call value describing one requested operation.
//!
//! A descriptor is validated when it is built and never mutated afterwards. Buffers
//! are `bytes::Bytes`, so the scheduler can hold cheap reference-counted copies for
//! the in-flight window without requiring anything of the caller after submission.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Raw expiry values at or below this are relative seconds; larger values are
/// absolute Unix timestamps. 2,592,000 seconds is thirty days.
pub const RELATIVE_EXPIRY_CUTOFF: u32 = 2_592_000;

/// Longest routing key the wire header can carry (its length field is u16).
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// The kind of operation a descriptor requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
  Fetch,
  Upsert,
  Add,
  Replace,
  Append,
  Prepend,
  Remove,
  Touch,
  /// Query whose rows stream back as multiple callback invocations.
  Query,
  /// Generic administrative request, dispatched through the same pipeline.
  Admin,
}

impl OperationKind {
  /// Store-family operations (full value replacement semantics).
  pub fn is_store(self) -> bool {
    matches!(self, Self::Upsert | Self::Add | Self::Replace)
  }

  fn requires_value(self) -> bool {
    matches!(
      self,
      Self::Upsert | Self::Add | Self::Replace | Self::Append | Self::Prepend | Self::Query
    )
  }

  fn forbids_value(self) -> bool {
    matches!(self, Self::Fetch | Self::Remove | Self::Touch)
  }
}

/// Document expiry. The wire carries a single u32; [`RELATIVE_EXPIRY_CUTOFF`]
/// disambiguates relative seconds from absolute Unix time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
  #[default]
  None,
  /// Seconds from now; must be at or below [`RELATIVE_EXPIRY_CUTOFF`].
  Relative(u32),
  /// Absolute Unix timestamp in seconds.
  Absolute(u32),
}

impl Expiry {
  /// Interpret a raw wire value the way the server does.
  pub fn from_raw(raw: u32) -> Self {
    if raw == 0 {
      Self::None
    } else if raw <= RELATIVE_EXPIRY_CUTOFF {
      Self::Relative(raw)
    } else {
      Self::Absolute(raw)
    }
  }

  pub fn to_wire(self) -> u32 {
    match self {
      Self::None => 0,
      Self::Relative(secs) => secs,
      Self::Absolute(ts) => ts,
    }
  }
}

/// HTTP-style method for administrative requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminMethod {
  Get,
  Post,
  Put,
  Delete,
}

impl AdminMethod {
  pub fn to_wire(self) -> u8 {
    match self {
      Self::Get => 0x01,
      Self::Post => 0x02,
      Self::Put => 0x03,
      Self::Delete => 0x04,
    }
  }

  pub fn from_wire(raw: u8) -> Option<Self> {
    match raw {
      0x01 => Some(Self::Get),
      0x02 => Some(Self::Post),
      0x03 => Some(Self::Put),
      0x04 => Some(Self::Delete),
      _ => None,
    }
  }
}

/// Immutable description of one requested operation.
///
/// Built through the constructors on this type ([`CommandDescriptor::fetch`],
/// [`CommandDescriptor::upsert`], ...), which return a [`CommandBuilder`] for the
/// optional fields. Validation happens in [`CommandBuilder::build`]; an invalid
/// combination fails there with [`Error::InvalidArgument`] and never reaches the
/// asynchronous completion path.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
  kind: OperationKind,
  key: Bytes,
  value: Option<Bytes>,
  cas: Option<u64>,
  expiry: Expiry,
  format: u32,
  admin_method: Option<AdminMethod>,
}

impl CommandDescriptor {
  fn builder(kind: OperationKind, key: Bytes, value: Option<Bytes>) -> CommandBuilder {
    CommandBuilder {
      inner: CommandDescriptor {
        kind,
        key,
        value,
        cas: None,
        expiry: Expiry::None,
        format: 0,
        admin_method: None,
      },
    }
  }

  /// Fetch the document stored under `key`.
  pub fn fetch(key: impl Into<Bytes>) -> CommandBuilder {
    Self::builder(OperationKind::Fetch, key.into(), None)
  }

  /// Store `value` under `key`, creating or overwriting.
  pub fn upsert(key: impl Into<Bytes>, value: impl Into<Bytes>) -> CommandBuilder {
    Self::builder(OperationKind::Upsert, key.into(), Some(value.into()))
  }

  /// Store `value` under `key` only if the key does not exist.
  pub fn add(key: impl Into<Bytes>, value: impl Into<Bytes>) -> CommandBuilder {
    Self::builder(OperationKind::Add, key.into(), Some(value.into()))
  }

  /// Store `value` under `key` only if the key already exists.
  pub fn replace(key: impl Into<Bytes>, value: impl Into<Bytes>) -> CommandBuilder {
    Self::builder(OperationKind::Replace, key.into(), Some(value.into()))
  }

  /// Append `value` to the existing document.
  pub fn append(key: impl Into<Bytes>, value: impl Into<Bytes>) -> CommandBuilder {
    Self::builder(OperationKind::Append, key.into(), Some(value.into()))
  }

  /// Prepend `value` to the existing document.
  pub fn prepend(key: impl Into<Bytes>, value: impl Into<Bytes>) -> CommandBuilder {
    Self::builder(OperationKind::Prepend, key.into(), Some(value.into()))
  }

  /// Remove the document stored under `key`.
  pub fn remove(key: impl Into<Bytes>) -> CommandBuilder {
    Self::builder(OperationKind::Remove, key.into(), None)
  }

  /// Update the expiry of the document stored under `key`.
  pub fn touch(key: impl Into<Bytes>, expiry: Expiry) -> CommandBuilder {
    let mut b = Self::builder(OperationKind::Touch, key.into(), None);
    b.inner.expiry = expiry;
    b
  }

  /// Submit an encoded query statement. The statement body doubles as the
  /// routing key; see [`crate::query::QueryRequest`] for the typed front end.
  pub fn query(body: impl Into<Bytes>) -> CommandBuilder {
    let body = body.into();
    Self::builder(OperationKind::Query, body.clone(), Some(body))
  }

  /// Generic administrative request, sharing the submit/complete/callback
  /// mechanics of the key-value operations.
  pub fn admin(method: AdminMethod, path: impl Into<Bytes>, body: Option<Bytes>) -> CommandBuilder {
    let mut b = Self::builder(OperationKind::Admin, path.into(), body);
    b.inner.admin_method = Some(method);
    b
  }

  pub fn kind(&self) -> OperationKind {
    self.kind
  }

  /// The routing key: which node this command maps to.
  pub fn key(&self) -> &Bytes {
    &self.key
  }

  pub fn value(&self) -> Option<&Bytes> {
    self.value.as_ref()
  }

  /// Compare-and-swap token; `None` means unconditional.
  pub fn cas(&self) -> Option<u64> {
    self.cas
  }

  pub fn expiry(&self) -> Expiry {
    self.expiry
  }

  /// Opaque content-encoding tag. Never interpreted by the scheduler.
  pub fn format(&self) -> u32 {
    self.format
  }

  pub fn admin_method(&self) -> Option<AdminMethod> {
    self.admin_method
  }
}

/// Builder for the optional descriptor fields.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
  inner: CommandDescriptor,
}

impl CommandBuilder {
  /// Require the stored document to carry this compare-and-swap token.
  pub fn cas(mut self, cas: u64) -> Self {
    self.inner.cas = Some(cas);
    self
  }

  pub fn expiry(mut self, expiry: Expiry) -> Self {
    self.inner.expiry = expiry;
    self
  }

  /// Opaque content-encoding tag carried alongside the value.
  pub fn format(mut self, format: u32) -> Self {
    self.inner.format = format;
    self
  }

  /// Validate and produce the immutable descriptor.
  pub fn build(self) -> Result<CommandDescriptor> {
    let d = self.inner;
    if d.key.is_empty() {
      return Err(Error::InvalidArgument("routing key must not be empty".into()));
    }
    if d.key.len() > MAX_KEY_SIZE {
      return Err(Error::InvalidArgument(format!(
        "routing key of {} bytes exceeds maximum {}",
        d.key.len(),
        MAX_KEY_SIZE
      )));
    }
    if d.kind.requires_value() && d.value.as_ref().map_or(true, |v| v.is_empty()) {
      return Err(Error::InvalidArgument(format!(
        "{:?} requires a non-empty value",
        d.kind
      )));
    }
    if d.kind.forbids_value() && d.value.is_some() {
      return Err(Error::InvalidArgument(format!(
        "{:?} does not take a value",
        d.kind
      )));
    }
    match d.expiry {
      Expiry::Relative(secs) if secs > RELATIVE_EXPIRY_CUTOFF => {
        return Err(Error::InvalidArgument(format!(
          "relative expiry {} exceeds cutoff {}",
          secs, RELATIVE_EXPIRY_CUTOFF
        )));
      }
      // Below the cutoff the raw value reads back as relative seconds, so the
      // requested meaning cannot survive the wire.
      Expiry::Absolute(ts) if ts <= RELATIVE_EXPIRY_CUTOFF => {
        return Err(Error::InvalidArgument(format!(
          "absolute expiry {} is at or below cutoff {} and would decode as relative",
          ts, RELATIVE_EXPIRY_CUTOFF
        )));
      }
      _ => {}
    }
    if d.kind == OperationKind::Add && d.cas.is_some() {
      return Err(Error::InvalidArgument(
        "add cannot carry a compare-and-swap token".into(),
      ));
    }
    if d.kind == OperationKind::Admin && d.admin_method.is_none() {
      return Err(Error::InvalidArgument("admin request needs a method".into()));
    }
    Ok(d)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_key_rejected() {
    let err = CommandDescriptor::fetch("").build().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
  }

  #[test]
  fn test_store_requires_value() {
    let err = CommandDescriptor::upsert("k", "").build().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
  }

  #[test]
  fn test_add_rejects_cas() {
    let err = CommandDescriptor::add("k", "v").cas(7).build().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
  }

  #[test]
  fn test_oversized_key_rejected() {
    let key = vec![b'k'; MAX_KEY_SIZE + 1];
    let err = CommandDescriptor::fetch(key).build().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let key = vec![b'k'; MAX_KEY_SIZE];
    assert!(CommandDescriptor::fetch(key).build().is_ok());
  }

  #[test]
  fn test_absolute_expiry_below_cutoff_rejected() {
    // Such a value would come back off the wire as relative seconds.
    let err = CommandDescriptor::upsert("k", "v")
      .expiry(Expiry::Absolute(1000))
      .build()
      .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let ok = CommandDescriptor::upsert("k", "v")
      .expiry(Expiry::Absolute(RELATIVE_EXPIRY_CUTOFF + 1))
      .build();
    assert!(ok.is_ok());
  }

  #[test]
  fn test_relative_expiry_cutoff() {
    let ok = CommandDescriptor::upsert("k", "v")
      .expiry(Expiry::Relative(RELATIVE_EXPIRY_CUTOFF))
      .build();
    assert!(ok.is_ok());

    let err = CommandDescriptor::upsert("k", "v")
      .expiry(Expiry::Relative(RELATIVE_EXPIRY_CUTOFF + 1))
      .build();
    assert!(err.is_err());
  }

  #[test]
  fn test_expiry_raw_interpretation() {
    assert_eq!(Expiry::from_raw(0), Expiry::None);
    assert_eq!(Expiry::from_raw(60), Expiry::Relative(60));
    assert_eq!(
      Expiry::from_raw(RELATIVE_EXPIRY_CUTOFF + 1),
      Expiry::Absolute(RELATIVE_EXPIRY_CUTOFF + 1)
    );
  }

  #[test]
  fn test_query_routes_by_statement() {
    let d = CommandDescriptor::query("SELECT 1").build().unwrap();
    assert_eq!(d.key(), &Bytes::from("SELECT 1"));
    assert_eq!(d.value().unwrap(), &Bytes::from("SELECT 1"));
  }
}
