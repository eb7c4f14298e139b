//! Concurrent multi-session tests through the full engine.

use oriondb::{Cid, Config, Database, Error, Oid, StoreRequest};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn request(oid: Oid, image: &[u8]) -> StoreRequest {
    StoreRequest {
        oid,
        cid: Cid::new(64),
        image: image.to_vec(),
    }
}

#[test]
fn writers_on_the_same_object_serialize() {
    let db = Arc::new(Database::open(Config::default()).unwrap());
    let mut setup = db.begin().unwrap();
    let oid = db.new_oid_block(&setup, 1).unwrap();
    db.store_objects(&mut setup, vec![request(oid, b"0")]).unwrap();
    db.commit(setup).unwrap();

    let mut handles = Vec::new();
    for worker in 0..4u8 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for i in 0..10u8 {
                let mut txn = db.begin().unwrap();
                db.store_objects(&mut txn, vec![request(oid, &[worker, i])])
                    .unwrap();
                db.commit(txn).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let txn = db.begin().unwrap();
    let image = db.load_objects(&txn, &[oid]).unwrap().remove(0);
    assert_eq!(image.len(), 2, "last committed image is intact");
    db.rollback(txn).unwrap();
    assert_eq!(db.active_transactions(), 0);
    db.close().unwrap();
}

#[test]
fn cross_store_deadlock_surfaces_as_deadlock_error() {
    let config = Config {
        lock_wait_ms: Some(5_000),
        ..Config::default()
    };
    let db = Arc::new(Database::open(config).unwrap());
    let mut setup = db.begin().unwrap();
    let first = db.new_oid_block(&setup, 2).unwrap();
    let oid_a = first;
    let oid_b = Oid::new(first.as_u64() + 1);
    db.store_objects(&mut setup, vec![request(oid_a, b"a"), request(oid_b, b"b")])
        .unwrap();
    db.commit(setup).unwrap();

    let mut txn_a = db.begin().unwrap();
    let mut txn_b = db.begin().unwrap();
    db.store_objects(&mut txn_a, vec![request(oid_a, b"a1")]).unwrap();
    db.store_objects(&mut txn_b, vec![request(oid_b, b"b1")]).unwrap();

    // txn_a blocks on oid_b in a helper thread...
    let db2 = Arc::clone(&db);
    let blocked = thread::spawn(move || {
        let outcome = db2.store_objects(&mut txn_a, vec![request(oid_b, b"a2")]);
        (txn_a, outcome)
    });
    thread::sleep(Duration::from_millis(150));

    // ...and txn_b closing the cycle is refused with a deadlock.
    let err = db
        .store_objects(&mut txn_b, vec![request(oid_a, b"b2")])
        .unwrap_err();
    assert!(matches!(err, Error::Deadlock { .. }));

    // Aborting the deadlocked transaction unblocks the other.
    db.rollback(txn_b).unwrap();
    let (txn_a, outcome) = blocked.join().unwrap();
    outcome.unwrap();
    db.commit(txn_a).unwrap();

    let txn = db.begin().unwrap();
    assert_eq!(
        db.load_objects(&txn, &[oid_a, oid_b]).unwrap(),
        vec![b"a1".to_vec(), b"a2".to_vec()]
    );
    db.rollback(txn).unwrap();
    db.close().unwrap();
}

#[test]
fn distinct_objects_do_not_contend() {
    let db = Arc::new(Database::open(Config::default()).unwrap());
    let mut setup = db.begin().unwrap();
    let first = db.new_oid_block(&setup, 8).unwrap();
    db.commit(setup).unwrap();

    let mut handles = Vec::new();
    for worker in 0..8u64 {
        let db = Arc::clone(&db);
        let oid = Oid::new(first.as_u64() + worker);
        handles.push(thread::spawn(move || {
            let mut txn = db.begin().unwrap();
            db.store_objects(&mut txn, vec![request(oid, &vec![worker as u8; 300])])
                .unwrap();
            db.commit(txn).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let txn = db.begin().unwrap();
    for worker in 0..8u64 {
        let oid = Oid::new(first.as_u64() + worker);
        assert_eq!(
            db.load_objects(&txn, &[oid]).unwrap(),
            vec![vec![worker as u8; 300]]
        );
    }
    db.rollback(txn).unwrap();
    db.close().unwrap();
}
