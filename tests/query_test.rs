mod common;

use common::*;
use warren_db::{DbError, Value};

fn chain_db(dir: &std::path::Path) -> warren_db::Database {
    let db = open_db(dir);
    let person = write_file(dir, "person.csv", "1\n2\n3\n4\n");
    let knows = write_file(dir, "knows.csv", "1,2\n2,3\n3,4\n");
    run_write(&db, "CREATE NODE TABLE Person(id INT64, PRIMARY KEY(id))");
    run_write(&db, "CREATE REL TABLE Knows(FROM Person TO Person)");
    run_write(&db, &format!("COPY Person FROM '{}'", person));
    run_write(&db, &format!("COPY Knows FROM '{}'", knows));
    db
}

/// Scenario S5: variable-length rels over a chain.
#[test]
fn variable_length_extend() {
    let dir = setup();
    let db = chain_db(dir.path());
    let rows = query(
        &db,
        "MATCH (a:Person {id: 1})-[*2..3]->(b) RETURN b.id ORDER BY b.id",
    );
    assert_eq!(i64_column(&rows, 0), vec![3, 4]);

    // a single-hop bound behaves like a plain extend
    let rows = query(
        &db,
        "MATCH (a:Person {id: 1})-[*1..1]->(b) RETURN b.id",
    );
    assert_eq!(i64_column(&rows, 0), vec![2]);
}

/// Two-hop pattern through the planner's extend chain.
#[test]
fn two_hop_match() {
    let dir = setup();
    let db = chain_db(dir.path());
    let rows = query(
        &db,
        "MATCH (a)-[:Knows]->(b)-[:Knows]->(c) RETURN a.id, c.id ORDER BY a.id",
    );
    assert_eq!(i64_column(&rows, 0), vec![1, 2]);
    assert_eq!(i64_column(&rows, 1), vec![3, 4]);
}

#[test]
fn where_filters_and_operators() {
    let dir = setup();
    let db = chain_db(dir.path());
    let rows = query(
        &db,
        "MATCH (p:Person) WHERE p.id > 1 AND p.id <> 3 RETURN p.id ORDER BY p.id",
    );
    assert_eq!(i64_column(&rows, 0), vec![2, 4]);

    let rows = query(
        &db,
        "MATCH (p:Person) WHERE p.id + 1 = 3 RETURN p.id",
    );
    assert_eq!(i64_column(&rows, 0), vec![2]);
}

#[test]
fn skip_limit_distinct() {
    let dir = setup();
    let db = chain_db(dir.path());
    let rows = query(&db, "MATCH (p:Person) RETURN p.id ORDER BY p.id SKIP 1 LIMIT 2");
    assert_eq!(i64_column(&rows, 0), vec![2, 3]);

    let rows = query(
        &db,
        "MATCH (a)-[:Knows]->(b) RETURN DISTINCT 1 AS one",
    );
    assert_eq!(rows, vec![vec![Value::Int64(1)]]);
}

#[test]
fn aggregates() {
    let dir = setup();
    let db = chain_db(dir.path());
    assert_eq!(query_single_i64(&db, "MATCH (p:Person) RETURN count(*)"), 4);
    let rows = query(
        &db,
        "MATCH (p:Person) RETURN min(p.id), max(p.id), sum(p.id), avg(p.id)",
    );
    assert_eq!(rows[0][0], Value::Int64(1));
    assert_eq!(rows[0][1], Value::Int64(4));
    assert_eq!(rows[0][2], Value::Int64(10));
    assert_eq!(rows[0][3], Value::Double(2.5));

    // grouped: out-degree per source node
    let rows = query(
        &db,
        "MATCH (a)-[:Knows]->(b) RETURN a.id, count(b) AS degree ORDER BY a.id",
    );
    assert_eq!(i64_column(&rows, 0), vec![1, 2, 3]);
    assert_eq!(i64_column(&rows, 1), vec![1, 1, 1]);
}

#[test]
fn unwind_and_with() {
    let dir = setup();
    let db = open_db(dir.path());
    let rows = query(&db, "UNWIND [3, 1, 2] AS x RETURN x ORDER BY x");
    assert_eq!(i64_column(&rows, 0), vec![1, 2, 3]);

    let rows = query(
        &db,
        "UNWIND [1, 2, 3] AS x WITH x WHERE x > 1 RETURN x ORDER BY x",
    );
    assert_eq!(i64_column(&rows, 0), vec![2, 3]);
}

#[test]
fn with_carries_vars_into_next_part() {
    let dir = setup();
    let db = chain_db(dir.path());
    let rows = query(
        &db,
        "MATCH (a:Person) WITH a.id AS src ORDER BY src LIMIT 2 RETURN src",
    );
    assert_eq!(i64_column(&rows, 0), vec![1, 2]);
}

#[test]
fn optional_match_pads_with_nulls() {
    let dir = setup();
    let db = chain_db(dir.path());
    // node 4 has no outgoing rel
    let rows = query(
        &db,
        "MATCH (a:Person) OPTIONAL MATCH (a)-[:Knows]->(b) RETURN a.id, b.id ORDER BY a.id",
    );
    assert_eq!(i64_column(&rows, 0), vec![1, 2, 3, 4]);
    assert_eq!(rows[3][1], Value::Null);
}

#[test]
fn set_and_delete() {
    let dir = setup();
    let db = open_db(dir.path());
    run_write(
        &db,
        "CREATE NODE TABLE Person(id INT64, name STRING, PRIMARY KEY(id))",
    );
    let csv = write_file(dir.path(), "person.csv", "1,a\n2,b\n");
    run_write(&db, &format!("COPY Person FROM '{}'", csv));

    run_write(&db, "MATCH (p:Person {id: 1}) SET p.name = 'renamed'");
    let rows = query(&db, "MATCH (p:Person {id: 1}) RETURN p.name");
    assert_eq!(rows, vec![vec![Value::String("renamed".to_string())]]);

    run_write(&db, "MATCH (p:Person {id: 2}) DELETE p");
    assert_eq!(
        query_single_i64(&db, "MATCH (p:Person) RETURN count(p)"),
        1
    );
    // the freed offset is recycled by a later CREATE
    run_write(&db, "CREATE (p:Person {id: 5, name: 'new'})");
    let rows = query(&db, "MATCH (p:Person) RETURN p.id ORDER BY p.id");
    assert_eq!(i64_column(&rows, 0), vec![1, 5]);
}

#[test]
fn delete_with_rels_is_rejected() {
    let dir = setup();
    let db = chain_db(dir.path());
    let tx = db.begin_write().unwrap();
    let err = db
        .execute(&tx, "MATCH (p:Person {id: 2}) DELETE p")
        .unwrap_err();
    assert!(matches!(err, DbError::Binder(_)), "{:?}", err);
    db.rollback(&tx).unwrap();
}

#[test]
fn explain_returns_a_plan() {
    let dir = setup();
    let db = chain_db(dir.path());
    let rows = query(
        &db,
        "EXPLAIN MATCH (a)-[:Knows]->(b) RETURN a.id",
    );
    assert!(!rows.is_empty());
    match &rows[0][0] {
        Value::String(plan) => {
            assert!(plan.contains("SCAN"), "{}", plan);
            assert!(plan.contains("EXTEND"), "{}", plan);
        }
        other => panic!("expected a plan string, got {:?}", other),
    }
}

#[test]
fn parse_and_bind_errors_surface() {
    let dir = setup();
    let db = chain_db(dir.path());
    let tx = db.begin_read().unwrap();
    let err = db
        .execute(&tx, "MATCH (p:Person) WHERE p.id != 1 RETURN p.id")
        .unwrap_err();
    assert!(matches!(err, DbError::Parser { .. }), "{:?}", err);

    let err = db
        .execute(&tx, "MATCH (p:Nope) RETURN p.id")
        .unwrap_err();
    assert!(matches!(err, DbError::Binder(_)), "{:?}", err);

    let err = db
        .execute(&tx, "MATCH (p:Person) RETURN p.age")
        .unwrap_err();
    assert!(matches!(err, DbError::Binder(_)), "{:?}", err);
    db.commit(&tx).unwrap();
}

#[test]
fn write_statement_needs_write_tx() {
    let dir = setup();
    let db = chain_db(dir.path());
    let tx = db.begin_read().unwrap();
    let err = db
        .execute(&tx, "CREATE (p:Person {id: 99})")
        .unwrap_err();
    assert!(matches!(err, DbError::Transaction(_)), "{:?}", err);
    db.commit(&tx).unwrap();
}

#[test]
fn single_writer_is_enforced() {
    let dir = setup();
    let db = chain_db(dir.path());
    let tx = db.begin_write().unwrap();
    let err = db.begin_write().unwrap_err();
    assert!(matches!(err, DbError::Transaction(_)));
    db.commit(&tx).unwrap();
    assert!(db.begin_write().is_ok());
}

#[test]
fn comment_on_table() {
    let dir = setup();
    let db = chain_db(dir.path());
    run_write(&db, "COMMENT ON TABLE Person IS 'people table'");
    // surviving a reopen proves it reached the catalog file
    db.close();
    let db = open_db(dir.path());
    assert_eq!(
        query_single_i64(&db, "MATCH (p:Person) RETURN count(p)"),
        4
    );
}

#[test]
fn copy_to_writes_csv() {
    let dir = setup();
    let db = chain_db(dir.path());
    let out = dir.path().join("out.csv");
    let tx = db.begin_read().unwrap();
    db.execute(
        &tx,
        &format!(
            "COPY (MATCH (p:Person) RETURN p.id ORDER BY p.id) TO '{}'",
            out.to_string_lossy()
        ),
    )
    .unwrap();
    db.commit(&tx).unwrap();
    let content = std::fs::read_to_string(&out).unwrap();
    assert_eq!(content, "p.id\n1\n2\n3\n4\n");
}
