use doc_store::{Config, Doc};
use test_log::test;

#[test]
fn recreate_after_delete_extends_history() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    let rev1 = db.save_doc(Doc::new("a", "1"))?;
    let rev2 = db.save_doc(Doc::update("a", &rev1, "2"))?;

    let deletion = db.delete_doc("a", &rev2)?;
    assert_eq!(3, deletion.pos);

    let snap = db.snapshot()?;
    assert_eq!(3, snap.update_seq());
    assert_eq!(0, snap.doc_count());
    assert_eq!(1, snap.deleted_doc_count());
    assert!(snap.doc("a")?.is_none());

    // a brand-new write (no parent rev) recreates the document as a
    // subsequent edit of the deletion, not as a conflict
    let recreated = db.save_doc(Doc::new("a", "new"))?;
    assert_eq!(deletion.pos + 1, recreated.pos);

    let snap = db.snapshot()?;
    assert_eq!(4, snap.update_seq());
    assert_eq!(1, snap.doc_count());
    assert_eq!(0, snap.deleted_doc_count());

    let doc = snap.doc("a")?.expect("doc is back");
    assert_eq!(recreated, doc.rev);
    assert_eq!(&*doc.body, b"new".as_slice());

    // still a single linear history
    let info = snap.full_doc_info("a")?.expect("doc exists");
    assert_eq!(1, info.rev_tree.leaf_count());

    Ok(())
}

#[test]
fn delete_missing_doc_conflicts() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    let bogus = doc_store::Revision::new(1, [0u8; 16]);
    assert!(db.delete_doc("ghost", &bogus).is_err());

    Ok(())
}
