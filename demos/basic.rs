//! Basic example touring the OakDB SDK scheduling surface.
//!
//! Runs against the deterministic in-memory harness so it works without a
//! server; swap the connector for a TCP one against a real cluster.

use oakdb::query::QueryRequest;
use oakdb::testing::StubNet;
use oakdb::{AdminMethod, Cluster, ClusterOptions, CommandDescriptor, OperationKind, Outcome};
use serde_json::json;

fn main() -> oakdb::Result<()> {
  let net = StubNet::new();
  net.set_query_rows(vec![json!({"name": "Alice"}), json!({"name": "Bob"})]);

  // The cookie type is ours to choose; here a plain label per operation.
  let mut cluster: Cluster<&'static str> =
    Cluster::new(ClusterOptions::default(), net.connector());
  cluster.add_node("10.0.0.1:11210");
  cluster.add_node("10.0.0.2:11210");

  cluster.install_handler(OperationKind::Query, |result, cookie| {
    match &result.outcome {
      Outcome::Row { payload } => {
        println!("[{}] row: {}", cookie, String::from_utf8_lossy(payload));
      }
      Outcome::Ok { value, .. } => {
        let meta = value.as_deref().unwrap_or(b"{}");
        println!("[{}] query done: {}", cookie, String::from_utf8_lossy(meta));
      }
      Outcome::Failed(f) => println!("[{}] query failed: {}", cookie, f),
    }
  });
  cluster.install_default_handler(|result, cookie| match &result.outcome {
    Outcome::Ok { cas, value, .. } => {
      let shown = value
        .as_deref()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default();
      println!("[{}] {:?} ok (cas {}) {}", cookie, result.kind, cas, shown);
    }
    Outcome::Row { .. } => {}
    Outcome::Failed(f) => println!("[{}] {:?} failed: {}", cookie, result.kind, f),
  });

  // Store, then read back.
  cluster.submit(
    CommandDescriptor::upsert("user::1001", r#"{"name":"Alice"}"#).build()?,
    "upsert",
  )?;
  cluster.submit(CommandDescriptor::fetch("user::1001").build()?, "fetch")?;

  // Add twice: the second one is rejected by the server with key-exists.
  cluster.submit(
    CommandDescriptor::add("counter", "1").build()?,
    "add-first",
  )?;
  cluster.submit(
    CommandDescriptor::add("counter", "2").build()?,
    "add-again",
  )?;

  // Stream a query's rows through the same dispatch machinery.
  let query = QueryRequest::new("SELECT name FROM users").into_descriptor()?;
  cluster.submit(query.build()?, "query")?;

  // Administrative requests share the pipeline too.
  cluster.admin_request(AdminMethod::Get, "/pools/default", None, "admin")?;

  // No event loop here, so let the blocking adapter drive dispatch.
  cluster.wait_all();
  Ok(())
}
