use doc_store::{Config, Doc};
use test_log::test;

#[test]
fn writes_are_acknowledged_before_commit() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    db.save_doc(Doc::new("a", "1"))?;

    let snap = db.snapshot()?;
    assert_eq!(1, snap.update_seq());

    // the header write is owed, not done
    assert_eq!(0, snap.committed_update_seq());

    let committed = db.full_commit()?;
    assert_eq!(1, committed);
    assert_eq!(1, db.snapshot()?.committed_update_seq());

    Ok(())
}

#[test]
fn delayed_commit_fires_by_itself() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    db.save_doc(Doc::new("a", "1"))?;

    // the timer is 1s; give it some slack
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);

    while db.snapshot()?.committed_update_seq() != 1 {
        assert!(
            std::time::Instant::now() < deadline,
            "delayed commit did not fire",
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    Ok(())
}

#[test]
fn full_commit_write_option_commits_immediately() -> doc_store::Result<()> {
    use doc_store::UpdateOptions;

    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    db.update_docs(
        vec![Doc::new("a", "1")],
        &UpdateOptions {
            replicated: false,
            full_commit: true,
        },
    )?;

    assert_eq!(1, db.snapshot()?.committed_update_seq());

    Ok(())
}

#[test]
fn clean_shutdown_commits_pending_writes() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("x.store");

    {
        let db = Config::new(&path).open()?;
        db.save_doc(Doc::new("a", "1"))?;
        // dropped with a delayed commit still armed
    }

    let db = Config::new(&path).open()?;
    assert_eq!(1, db.snapshot()?.update_seq());
    assert!(db.doc("a")?.is_some());

    Ok(())
}
