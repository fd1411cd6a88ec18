mod common;

use common::*;
use warren_db::Value;

/// Scenario S4: commit reaches the WAL but the checkpoint never runs;
/// reopening replays to the committed state and truncates the WAL.
#[test]
fn committed_wal_replays_on_reopen() {
    let dir = setup();
    {
        let db = open_db(dir.path());
        run_write(
            &db,
            "CREATE NODE TABLE Person(id INT64, name STRING, PRIMARY KEY(id))",
        );
        let tx = db.begin_write().unwrap();
        db.execute(&tx, "CREATE (p:Person {id: 42, name: 'R'})")
            .unwrap();
        // flush the WAL up to COMMIT, then "crash" before checkpoint
        db.commit_skip_checkpoint(&tx).unwrap();
        db.close();
    }
    {
        let db = open_db(dir.path());
        let rows = query(&db, "MATCH (p:Person {id: 42}) RETURN p.name");
        assert_eq!(rows, vec![vec![Value::String("R".to_string())]]);
        // recovery truncated the log
        let wal = std::fs::read(dir.path().join("wal.log")).unwrap();
        assert!(wal.is_empty());
    }
}

/// Crash before the commit record: the uncommitted work disappears.
#[test]
fn uncommitted_work_is_discarded_on_reopen() {
    let dir = setup();
    {
        let db = open_db(dir.path());
        run_write(
            &db,
            "CREATE NODE TABLE Person(id INT64, name STRING, PRIMARY KEY(id))",
        );
        let tx = db.begin_write().unwrap();
        db.execute(&tx, "CREATE (p:Person {id: 7, name: 'gone'})")
            .unwrap();
        // no commit: the write transaction dies with the process
        db.close();
    }
    {
        let db = open_db(dir.path());
        assert_eq!(
            query_single_i64(&db, "MATCH (p:Person) RETURN count(p)"),
            0
        );
    }
}

/// A bulk copy committed without checkpoint becomes visible after
/// recovery, shadow files and all.
#[test]
fn copy_survives_recovery() {
    let dir = setup();
    let csv = write_file(dir.path(), "person.csv", "1,Alice\n2,Bob\n");
    {
        let db = open_db(dir.path());
        run_write(
            &db,
            "CREATE NODE TABLE Person(id INT64, name STRING, PRIMARY KEY(id))",
        );
        let tx = db.begin_write().unwrap();
        db.execute(&tx, &format!("COPY Person FROM '{}'", csv))
            .unwrap();
        db.commit_skip_checkpoint(&tx).unwrap();
        db.close();
    }
    {
        let db = open_db(dir.path());
        let rows = query(&db, "MATCH (p:Person) RETURN p.id, p.name ORDER BY p.id");
        assert_eq!(i64_column(&rows, 0), vec![1, 2]);
        assert_eq!(string_column(&rows, 1), vec!["Alice", "Bob"]);
    }
}

/// An uncommitted bulk copy leaves nothing behind: no shadow files,
/// no statistics, an empty table.
#[test]
fn uncommitted_copy_is_rolled_back_on_reopen() {
    let dir = setup();
    let csv = write_file(dir.path(), "person.csv", "1,Alice\n");
    {
        let db = open_db(dir.path());
        run_write(
            &db,
            "CREATE NODE TABLE Person(id INT64, name STRING, PRIMARY KEY(id))",
        );
        let tx = db.begin_write().unwrap();
        db.execute(&tx, &format!("COPY Person FROM '{}'", csv))
            .unwrap();
        // crash without commit
        db.close();
    }
    {
        let db = open_db(dir.path());
        assert_eq!(
            query_single_i64(&db, "MATCH (p:Person) RETURN count(p)"),
            0
        );
        // the shadow files of the copy are gone
        let table_dir = dir.path().join("t0");
        if table_dir.exists() {
            for entry in std::fs::read_dir(&table_dir).unwrap() {
                let name = entry.unwrap().file_name();
                assert!(
                    !name.to_string_lossy().ends_with(".wal"),
                    "stale shadow file {:?}",
                    name
                );
            }
        }
    }
}

/// Recovery is idempotent: opening twice in a row reaches the same
/// state.
#[test]
fn reopening_twice_is_stable() {
    let dir = setup();
    let csv = write_file(dir.path(), "person.csv", "1,Alice\n2,Bob\n3,Carol\n");
    {
        let db = open_db(dir.path());
        run_write(
            &db,
            "CREATE NODE TABLE Person(id INT64, name STRING, PRIMARY KEY(id))",
        );
        let tx = db.begin_write().unwrap();
        db.execute(&tx, &format!("COPY Person FROM '{}'", csv))
            .unwrap();
        db.commit_skip_checkpoint(&tx).unwrap();
        db.close();
    }
    for _ in 0..2 {
        let db = open_db(dir.path());
        assert_eq!(
            query_single_i64(&db, "MATCH (p:Person) RETURN count(p)"),
            3
        );
        db.close();
    }
}

/// Explicit rollback restores the pre-transaction state in-process.
#[test]
fn rollback_undoes_create_and_ddl() {
    let dir = setup();
    let db = open_db(dir.path());
    run_write(
        &db,
        "CREATE NODE TABLE Person(id INT64, name STRING, PRIMARY KEY(id))",
    );

    let tx = db.begin_write().unwrap();
    db.execute(&tx, "CREATE (p:Person {id: 9, name: 'x'})")
        .unwrap();
    db.execute(&tx, "CREATE NODE TABLE Temp(id INT64, PRIMARY KEY(id))")
        .unwrap();
    db.rollback(&tx).unwrap();

    assert_eq!(
        query_single_i64(&db, "MATCH (p:Person) RETURN count(p)"),
        0
    );
    let tx = db.begin_read().unwrap();
    let err = db.execute(&tx, "MATCH (t:Temp) RETURN count(t)").unwrap_err();
    db.rollback(&tx).unwrap();
    assert!(err.to_string().contains("Temp"), "{}", err);
}

/// Updates inside a write transaction are invisible to a concurrent
/// reader until the checkpoint.
#[test]
fn readers_do_not_observe_in_flight_writes() {
    let dir = setup();
    let db = open_db(dir.path());
    run_write(
        &db,
        "CREATE NODE TABLE Person(id INT64, name STRING, PRIMARY KEY(id))",
    );

    let writer = db.begin_write().unwrap();
    db.execute(&writer, "CREATE (p:Person {id: 1, name: 'w'})")
        .unwrap();

    let reader = db.begin_read().unwrap();
    let count = db
        .execute(&reader, "MATCH (p:Person) RETURN count(p)")
        .unwrap();
    assert_eq!(count.rows[0][0], Value::Int64(0));
    db.commit(&reader).unwrap();

    db.commit(&writer).unwrap();
    assert_eq!(
        query_single_i64(&db, "MATCH (p:Person) RETURN count(p)"),
        1
    );
}
