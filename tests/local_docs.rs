use doc_store::{Config, Doc, Error, UpdateOptions, WriteOutcome};
use test_log::test;

fn set_local(db: &doc_store::Database, doc: Doc) -> doc_store::Result<WriteOutcome> {
    let mut outcomes = db.update_docs(vec![doc], &UpdateOptions::default())?;
    outcomes.pop().ok_or(Error::Stopped)
}

#[test]
fn local_docs_compare_and_set() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    // create: no rev means rev 0
    let outcome = set_local(&db, Doc::new("_local/checkpoint", "s1"))?;
    let rev1 = match outcome {
        WriteOutcome::Ok(rev) => rev,
        WriteOutcome::Conflict => panic!("fresh local doc must not conflict"),
    };
    assert_eq!(&*rev1.id, b"1".as_slice());

    // local docs never advance the update seq
    assert_eq!(0, db.snapshot()?.update_seq());

    // update with the stored rev
    let outcome = set_local(
        &db,
        Doc {
            rev_ids: vec![rev1.id.clone()],
            ..Doc::new("_local/checkpoint", "s2")
        },
    )?;
    let rev2 = match outcome {
        WriteOutcome::Ok(rev) => rev,
        WriteOutcome::Conflict => panic!("matching rev must not conflict"),
    };
    assert_eq!(&*rev2.id, b"2".as_slice());

    let snap = db.snapshot()?;
    let (stored_rev, body) = snap.local_doc("_local/checkpoint")?.expect("exists");
    assert_eq!(2, stored_rev);
    assert_eq!(&*body, b"s2".as_slice());

    // stale rev conflicts
    let outcome = set_local(
        &db,
        Doc {
            rev_ids: vec![rev1.id],
            ..Doc::new("_local/checkpoint", "s3")
        },
    )?;
    assert!(matches!(outcome, WriteOutcome::Conflict));

    // local docs are invisible to the document indexes
    assert_eq!(0, snap.doc_count());
    assert!(snap.full_doc_info("_local/checkpoint")?.is_none());

    Ok(())
}

#[test]
fn local_doc_delete() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    set_local(&db, Doc::new("_local/x", "v"))?;

    let outcome = set_local(
        &db,
        Doc {
            rev_ids: vec!["1".into()],
            deleted: true,
            ..Doc::new("_local/x", "")
        },
    )?;
    assert!(matches!(outcome, WriteOutcome::Ok(_)));

    assert!(db.snapshot()?.local_doc("_local/x")?.is_none());

    Ok(())
}

#[test]
fn local_docs_survive_reopen_after_commit() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("x.store");

    {
        let db = Config::new(&path).open()?;
        set_local(&db, Doc::new("_local/a", "kept"))?;
        db.full_commit()?;
    }

    let db = Config::new(&path).open()?;
    let (rev, body) = db
        .snapshot()?
        .local_doc("_local/a")?
        .expect("local doc survived");

    assert_eq!(1, rev);
    assert_eq!(&*body, b"kept".as_slice());

    Ok(())
}
