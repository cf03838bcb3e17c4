use doc_store::{Config, Doc, Slice, UpdateOptions};
use test_log::test;

#[test]
fn purge_removes_one_leaf() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    let rev1 = db.save_doc(Doc::new("a", "1"))?;

    // create a conflict via replication
    let foreign = Slice::from([0xEEu8; 16]);
    db.update_docs(
        vec![Doc::replicated("a", 1, vec![foreign.clone()], "x")],
        &UpdateOptions {
            replicated: true,
            full_commit: false,
        },
    )?;

    let seq_before = db.snapshot()?.update_seq();

    let rev_x = doc_store::Revision::new(1, foreign);
    let result = db.purge_docs(vec![(Slice::from("a"), vec![rev_x.clone()])])?;

    assert_eq!(1, result.purge_seq);
    assert_eq!(
        vec![(Slice::from("a"), vec![rev_x.clone()])],
        result.purged,
    );

    let snap = db.snapshot()?;
    assert_eq!(1, snap.purge_seq());

    // the purged revision is gone, the original survives under a fresh seq
    let info = snap.full_doc_info("a")?.expect("doc exists");
    assert_eq!(1, info.rev_tree.leaf_count());
    assert!(info.rev_tree.is_leaf(&rev1));
    assert!(!info.rev_tree.is_leaf(&rev_x));
    assert!(info.update_seq > seq_before);

    // the by-seq index moved the doc to its fresh seq
    let mut seqs = vec![];
    snap.changes_since(0, &mut |di| {
        seqs.push((di.id.clone(), di.high_seq));
        Ok(std::ops::ControlFlow::Continue(()))
    })?;
    assert_eq!(vec![(Slice::from("a"), info.update_seq)], seqs);

    Ok(())
}

#[test]
fn purge_last_leaf_removes_doc() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    let rev1 = db.save_doc(Doc::new("a", "1"))?;

    let result = db.purge_docs(vec![(Slice::from("a"), vec![rev1])])?;
    assert_eq!(1, result.purge_seq);

    let snap = db.snapshot()?;
    assert_eq!(0, snap.doc_count());
    assert_eq!(0, snap.deleted_doc_count());
    assert!(snap.full_doc_info("a")?.is_none());

    let mut count = 0;
    snap.changes_since(0, &mut |_| {
        count += 1;
        Ok(std::ops::ControlFlow::Continue(()))
    })?;
    assert_eq!(0, count);

    // purges survive reopen
    drop(snap);
    let path = db.path().to_path_buf();
    drop(db);

    let db = Config::new(path).open()?;
    assert_eq!(1, db.snapshot()?.purge_seq());

    Ok(())
}

#[test]
fn purge_seq_is_strictly_monotone() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    db.save_doc(Doc::new("a", "1"))?;
    db.save_doc(Doc::new("b", "2"))?;

    let mut last = 0;

    for id in ["a", "b"] {
        let info = db.snapshot()?.full_doc_info(id)?.expect("exists");
        let rev = info.winner().expect("has winner").rev;

        let result = db.purge_docs(vec![(Slice::from(id), vec![rev])])?;
        assert!(result.purge_seq > last);
        last = result.purge_seq;
    }

    Ok(())
}
