use doc_store::{Config, Doc};
use test_log::test;

#[test]
fn attachments_roundtrip() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    db.save_doc(
        Doc::new("with-atts", "body")
            .with_attachment("a.txt", "attachment one")
            .with_attachment("b.bin", vec![0u8; 10_000]),
    )?;

    let snap = db.snapshot()?;
    let doc = snap.doc("with-atts")?.expect("exists");

    assert_eq!(2, doc.atts.len());
    assert_eq!(&*doc.atts[0].name, b"a.txt".as_slice());
    assert_eq!(14, doc.atts[0].len);

    let payload = snap.read_attachment(&doc.atts[0])?;
    assert_eq!(&*payload, b"attachment one".as_slice());

    let payload = snap.read_attachment(&doc.atts[1])?;
    assert_eq!(10_000, payload.len());

    Ok(())
}

#[test]
fn attachments_survive_compaction() -> doc_store::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(folder.path().join("x.store")).open()?;

    db.save_doc(Doc::new("d", "body").with_attachment("file", "payload"))?;

    db.compact()?;

    let snap = db.snapshot()?;
    let doc = snap.doc("d")?.expect("exists");
    let payload = snap.read_attachment(&doc.atts[0])?;
    assert_eq!(&*payload, b"payload".as_slice());

    // sizes include attachments
    assert!(snap.data_size().expect("sizes tracked") > 7);

    Ok(())
}
