use doc_store::{Config, Doc};
use test_log::test;

#[test]
fn stemming_caps_tree_depth() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let path = folder.path().join("x.store");
    let db = Config::new(&path).open()?;

    db.set_revs_limit(5)?;

    let mut rev = db.save_doc(Doc::new("a", "0"))?;

    for i in 1..50u32 {
        rev = db.save_doc(Doc::update("a", &rev, format!("{i}")))?;
    }

    assert_eq!(50, rev.pos);

    let info = db.snapshot()?.full_doc_info("a")?.expect("exists");
    assert!(info.rev_tree.depth() <= 5);

    // the newest revision is still the leaf
    assert!(info.rev_tree.is_leaf(&rev));

    // the limit survives a reopen
    db.full_commit()?;
    drop(db);

    let db = Config::new(&path).open()?;
    assert_eq!(5, db.snapshot()?.revs_limit());

    // and survives compaction
    db.compact()?;
    assert_eq!(5, db.snapshot()?.revs_limit());

    Ok(())
}

#[test]
fn increment_update_seq_commits() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    assert_eq!(1, db.increment_update_seq()?);
    assert_eq!(2, db.increment_update_seq()?);

    let snap = db.snapshot()?;
    assert_eq!(2, snap.update_seq());
    assert_eq!(2, snap.committed_update_seq());

    Ok(())
}
