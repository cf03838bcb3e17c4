use doc_store::{Config, Doc, Error, Slice};
use test_log::test;

#[test]
fn purge_is_refused_while_compacting() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    let mut revs = vec![];
    for i in 0..5_000u32 {
        revs.push(db.save_doc(Doc::new(format!("doc-{i:05}"), format!("{i:0>64}")))?);
    }

    db.start_compact()?;

    // the compactor is busy for a while; the purge lands before hand-off
    let result = db.purge_docs(vec![(
        Slice::from("doc-00000"),
        vec![revs[0].clone()],
    )]);

    assert!(matches!(result, Err(Error::PurgeDuringCompaction)));

    // nothing was purged
    assert_eq!(0, db.snapshot()?.purge_seq());

    // after the compaction is done, purging works again
    while db.snapshot()?.is_compacting() {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    let result = db.purge_docs(vec![(
        Slice::from("doc-00000"),
        vec![revs[0].clone()],
    )])?;

    assert_eq!(1, result.purge_seq);
    assert!(db.snapshot()?.full_doc_info("doc-00000")?.is_none());

    Ok(())
}
