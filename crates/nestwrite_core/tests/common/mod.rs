#![allow(dead_code)]

use nestwrite_core::db::{open_db_in_memory, Migration};
use nestwrite_core::{EmbeddedResource, FieldBinding, FieldSpec, Record, TableSchema};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::Arc;

pub const ORDERS_SCHEMA: &str = "
CREATE TABLE orders (
    id TEXT PRIMARY KEY NOT NULL,
    customer TEXT NOT NULL,
    note TEXT
);
CREATE TABLE order_items (
    id TEXT PRIMARY KEY NOT NULL,
    order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    sku TEXT UNIQUE
);
CREATE TABLE order_comments (
    id TEXT PRIMARY KEY NOT NULL,
    order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    body TEXT NOT NULL,
    pinned INTEGER NOT NULL DEFAULT 0
);
";

pub const MIGRATIONS: &[Migration] = &[Migration::new(1, ORDERS_SCHEMA)];

pub fn setup() -> Connection {
    open_db_in_memory(MIGRATIONS).unwrap()
}

pub fn orders_schema() -> TableSchema {
    TableSchema::builder("orders")
        .field(FieldSpec::text("customer").max_length(64))
        .field(FieldSpec::text("note").optional().nullable())
        .build()
        .unwrap()
}

pub fn items_schema() -> TableSchema {
    TableSchema::builder("order_items")
        .field(FieldSpec::reference("order_id"))
        .field(FieldSpec::text("name").max_length(32))
        .field(FieldSpec::integer("quantity").min(1))
        .field(FieldSpec::text("sku").optional().nullable())
        .build()
        .unwrap()
}

pub fn comments_schema() -> TableSchema {
    TableSchema::builder("order_comments")
        .field(FieldSpec::reference("order_id"))
        .field(FieldSpec::text("body"))
        .field(FieldSpec::boolean("pinned").default_value(json!(false)))
        .build()
        .unwrap()
}

/// Orders with `items` and `comments`; pinned comments are never deleted and
/// `comments` is optional on reads.
pub fn orders_resource() -> Arc<EmbeddedResource> {
    let resource = EmbeddedResource::builder(Arc::new(orders_schema()))
        .embed(FieldBinding::new(
            "items",
            Arc::new(items_schema()),
            "order_id",
        ))
        .embed(
            FieldBinding::new("comments", Arc::new(comments_schema()), "order_id")
                .with_delete_guard(|comment| comment.get("pinned") != Some(&Value::Bool(true))),
        )
        .optional_field("comments")
        .build()
        .unwrap();
    Arc::new(resource)
}

pub fn id_of(record: &Record) -> String {
    record
        .get("id")
        .and_then(Value::as_str)
        .expect("record should carry an id")
        .to_string()
}

pub fn children<'a>(record: &'a Record, field: &str) -> &'a Vec<Value> {
    record
        .get(field)
        .and_then(Value::as_array)
        .expect("embedded field should be a list")
}

pub fn child_ids(record: &Record, field: &str) -> Vec<String> {
    children(record, field)
        .iter()
        .map(|child| {
            child
                .get("id")
                .and_then(Value::as_str)
                .expect("child should carry an id")
                .to_string()
        })
        .collect()
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })
    .unwrap()
}
