//! Fuzz test for positional row decoding
//!
//! Treats the input as a tab-separated table: the first line is the header,
//! every other line a row. Decoding hand-edited sheets must never panic; bad
//! rows are rejected one by one and a broken header is a schema error.
//!
//! Run with: cargo +nightly fuzz run row_decode_fuzz -- -max_total_time=60

#![no_main]

use classbook_core::{AccountingMasterItem, Lesson, Record, Reservation, RowSet, Student};
use libfuzzer_sys::fuzz_target;

fn check<R: Record>(set: &RowSet) {
    if let Ok(decoded) = set.decode::<R>() {
        let non_blank = set
            .rows
            .iter()
            .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
            .count();
        assert_eq!(decoded.records.len() + decoded.rejected.len(), non_blank);

        // Whatever decoded must survive its own encoding.
        let canonical = RowSet {
            header: R::columns().iter().map(|c| c.to_string()).collect(),
            rows: decoded.records.iter().map(Record::to_row).collect(),
        };
        let again = canonical.decode::<R>().expect("canonical header decodes");
        assert!(again.rejected.is_empty(), "re-encoded rows must decode");
    }
}

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let mut lines = input.lines().map(|line| line.split('\t').map(str::to_string).collect());
        let header: Vec<String> = lines.next().unwrap_or_default();
        let set = RowSet {
            header,
            rows: lines.collect(),
        };

        check::<Reservation>(&set);
        check::<Lesson>(&set);
        check::<Student>(&set);
        check::<AccountingMasterItem>(&set);
    }
});
