//! Unit tests for the JSON-lines writer and reader.

use super::*;
use std::io::Cursor;
use std::thread;

use cartage_core::test_support::{external_id, point_feature};
use cartage_core::{GeometryClass, InternalKey, ReferenceKind};
use parking_lot::Mutex as SharedMutex;
use rstest::rstest;

#[derive(Clone, Default)]
struct SharedBuffer(Arc<SharedMutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().clone()).expect("utf8 output")
    }
}

fn patch() -> ResolvedReference {
    ResolvedReference {
        kind: ReferenceKind::GroupMember,
        source: InternalKey::new(1),
        target: external_id("M1"),
        target_key: InternalKey::new(2),
        role: None,
    }
}

#[rstest]
fn features_and_patches_are_one_line_each() {
    let buffer = SharedBuffer::default();
    let writer = JsonLinesWriterFactory
        .open(Box::new(buffer.clone()))
        .expect("open");
    writer
        .write(&point_feature(1, "G1", 44, 0.0, 0.0))
        .expect("write");
    writer.apply(&patch()).expect("apply");
    writer.close().expect("close");

    let text = buffer.text();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines.first().is_some_and(|line| line.contains("\"record\":\"feature\"")));
    assert!(lines.last().is_some_and(|line| line.contains("\"record\":\"patch\"")));
}

#[rstest]
fn writes_after_close_are_refused() {
    let writer = JsonLinesWriter::new(Box::new(std::io::sink()));
    writer.close().expect("close");
    writer.close().expect("closing twice is harmless");
    let result = writer.write(&point_feature(1, "A", 26, 0.0, 0.0));
    assert!(matches!(result, Err(WriteError::Closed)));
    assert!(matches!(writer.apply(&patch()), Err(WriteError::Closed)));
}

#[rstest]
fn concurrent_writers_never_interleave_lines() {
    let buffer = SharedBuffer::default();
    let writer = JsonLinesWriter::new(Box::new(buffer.clone()));
    thread::scope(|scope| {
        for worker in 0..4 {
            let shared = &writer;
            scope.spawn(move || {
                for n in 0..25 {
                    let feature = point_feature(n, &format!("W{worker}_{n}"), 26, 0.0, 0.0)
                        .with_geometry(GeometryClass::Surface, 6);
                    shared.write(&feature).expect("write");
                }
            });
        }
    });
    writer.close().expect("close");
    assert_eq!(writer.lines_written(), 100);

    let text = buffer.text();
    let read: Vec<SourceFeature> = JsonLinesReader::new(Cursor::new(text))
        .collect::<Result<_, _>>()
        .expect("every line decodes");
    assert_eq!(read.len(), 100);
}

#[rstest]
fn exported_files_can_be_read_back() {
    let buffer = SharedBuffer::default();
    let writer = JsonLinesWriter::new(Box::new(buffer.clone()));
    let feature = point_feature(5, "BLDG_5", 26, 3.0, 4.0)
        .with_reference(ReferenceKind::FeatureLink, external_id("BLDG_6"));
    writer.write(&feature).expect("write");
    writer.apply(&patch()).expect("apply");
    writer.close().expect("close");

    let read: Vec<SourceFeature> = JsonLinesReader::new(Cursor::new(buffer.text()))
        .collect::<Result<_, _>>()
        .expect("decode");
    assert_eq!(read, vec![SourceFeature::from(feature)]);
}

#[rstest]
fn reader_skips_blank_lines_and_reports_line_numbers() {
    let input = concat!(
        "{\"type_id\":26,\"envelope\":{\"min\":{\"x\":0.0,\"y\":0.0},\"max\":{\"x\":1.0,\"y\":1.0}}}\n",
        "\n",
        "not json\n",
    );
    let mut reader = JsonLinesReader::new(Cursor::new(input));
    let first = reader.next().expect("first record").expect("decodes");
    assert_eq!(first.external_id, None);
    let second = reader.next().expect("second record");
    assert!(matches!(second, Err(ReadError::Decode { line: 3, .. })));
    assert!(reader.next().is_none());
}
